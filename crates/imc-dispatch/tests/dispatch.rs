//! End-to-end dispatch scenarios: modules resolving runtime operations
//! through the registry and calling the bus through them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use imc_bus::{Bus, Payload, SubscribeOptions};
use imc_common::Capabilities;
use imc_dispatch::bus_api::{
    CallRpcFn, FutureGetResultFn, FutureReleaseFn, GetLastErrorFn, GetRpcIdFn, GetTopicIdFn,
    HasCapabilityFn, PublishFn, PumpFn, RegisterRpcFn, SubscribeExFn,
};
use imc_dispatch::{bootstrap_core, ids, ApiMetadata, ApiRegistry};

fn bootstrapped_global() -> Arc<ApiRegistry> {
    let registry = ApiRegistry::global();
    // Idempotent across tests in this binary: duplicates are first-wins.
    let _ = bootstrap_core(&registry);
    registry
}

#[test]
fn api_ids_survive_unregister_and_reregister() {
    type ProbeFn = fn() -> u32;
    fn probe() -> u32 {
        1
    }

    let registry = ApiRegistry::new();
    assert!(registry.register(
        ApiMetadata::core("imcPublish", ids::IMC_PUBLISH, Capabilities::IMC_BASIC),
        Arc::new(probe as ProbeFn),
    ));
    assert_eq!(registry.api_id_of("imcPublish"), Some(ids::IMC_PUBLISH));
    assert_eq!(ids::IMC_PUBLISH.get(), 1010);

    assert!(registry.unregister("imcPublish"));
    assert!(registry.api_id_of("imcPublish").is_none());

    // The id is reserved: re-registration binds the same number.
    assert!(registry.register(
        ApiMetadata::core("imcPublish", ids::IMC_PUBLISH, Capabilities::IMC_BASIC),
        Arc::new(probe as ProbeFn),
    ));
    assert_eq!(registry.api_id_of("imcPublish"), Some(ids::IMC_PUBLISH));
    assert_eq!(ids::IMC_PUBLISH.get(), 1010);
}

#[test]
fn pubsub_round_trip_through_dispatched_pointers() {
    let registry = bootstrapped_global();

    let get_topic_id = registry
        .get_as::<GetTopicIdFn>(ids::IMC_GET_TOPIC_ID)
        .expect("imcGetTopicId");
    let subscribe_ex = registry
        .get_as::<SubscribeExFn>(ids::IMC_SUBSCRIBE_EX)
        .expect("imcSubscribeEx");
    let publish = registry.get_as::<PublishFn>(ids::IMC_PUBLISH).expect("imcPublish");
    let pump = registry.get_as::<PumpFn>(ids::IMC_PUMP).expect("imcPump");

    let topic = get_topic_id("dispatch.roundtrip").expect("topic id");
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    subscribe_ex(
        topic,
        SubscribeOptions::default(),
        Arc::new(move |_: &Bus, _, envelope: &imc_bus::Envelope| {
            sink.lock().expect("lock").push(envelope.data().to_vec());
        }),
    )
    .expect("subscribe");

    publish(topic, b"via pointer").expect("publish");
    // Tests in this binary share the global bus; another test's pump may
    // hold this subscription's consumer lock, so drain until delivered.
    let deadline = Instant::now() + Duration::from_secs(5);
    while received.lock().expect("lock").is_empty() && Instant::now() < deadline {
        pump(0);
        std::thread::yield_now();
    }

    assert_eq!(*received.lock().expect("lock"), vec![b"via pointer".to_vec()]);
}

#[test]
fn rpc_echo_through_dispatched_pointers() {
    let registry = bootstrapped_global();

    let get_rpc_id = registry.get_as::<GetRpcIdFn>(ids::IMC_GET_RPC_ID).expect("imcGetRpcId");
    let register_rpc = registry
        .get_as::<RegisterRpcFn>(ids::IMC_REGISTER_RPC)
        .expect("imcRegisterRpc");
    let call_rpc = registry.get_as::<CallRpcFn>(ids::IMC_CALL_RPC).expect("imcCallRpc");
    let get_result = registry
        .get_as::<FutureGetResultFn>(ids::IMC_FUTURE_GET_RESULT)
        .expect("imcFutureGetResult");
    let release = registry
        .get_as::<FutureReleaseFn>(ids::IMC_FUTURE_RELEASE)
        .expect("imcFutureRelease");

    let rpc = get_rpc_id("dispatch.echo").expect("rpc id");
    register_rpc(
        rpc,
        Arc::new(|_: &Bus, _, request: &imc_bus::Envelope| {
            Ok(Payload::copy_from(request.data()))
        }),
    )
    .expect("register");

    let future = call_rpc(rpc, Payload::copy_from(b"ping")).expect("call");
    let result = get_result(future).expect("result");
    assert_eq!(result.as_slice(), &b"ping"[..]);
    drop(result);
    release(future).expect("release");
}

#[test]
fn failed_calls_leave_a_last_error_record() {
    let registry = bootstrapped_global();

    let get_rpc_id = registry.get_as::<GetRpcIdFn>(ids::IMC_GET_RPC_ID).expect("imcGetRpcId");
    let call_rpc = registry.get_as::<CallRpcFn>(ids::IMC_CALL_RPC).expect("imcCallRpc");
    let get_last_error = registry
        .get_as::<GetLastErrorFn>(ids::GET_LAST_ERROR)
        .expect("getLastError");

    let rpc = get_rpc_id("dispatch.unregistered").expect("rpc id");
    assert!(call_rpc(rpc, Payload::empty()).is_err());

    let record = get_last_error().expect("record");
    assert_eq!(record.api_name, "imcCallRpc");
    assert_eq!(record.error, imc_common::Error::RpcNotRegistered);
}

#[test]
fn capability_queries_see_the_bootstrapped_surface() {
    let registry = bootstrapped_global();
    let has_capability = registry
        .get_as::<HasCapabilityFn>(ids::HAS_CAPABILITY)
        .expect("hasCapability");

    assert!(has_capability(Capabilities::IMC_BASIC | Capabilities::IMC_RPC));
    assert!(has_capability(Capabilities::CAPABILITY_QUERY));
    assert!(!has_capability(Capabilities::EXTENSION_VERSIONED));
}

#[test]
fn hot_path_resolution_through_the_thread_cache() {
    let registry = bootstrapped_global();

    let publish_handle = registry
        .get_by_id_cached(ids::IMC_PUBLISH)
        .and_then(|h| h.downcast::<PublishFn>().ok())
        .expect("cached resolve");
    let get_topic_id = registry
        .get_as::<GetTopicIdFn>(ids::IMC_GET_TOPIC_ID)
        .expect("imcGetTopicId");

    let topic = get_topic_id("dispatch.hot").expect("topic id");
    let hits = Arc::new(AtomicUsize::new(0));
    let count = hits.clone();
    Bus::global()
        .subscribe(topic, move |_, _, _| {
            count.fetch_add(1, Ordering::SeqCst);
        })
        .expect("subscribe");

    for _ in 0..100 {
        publish_handle(topic, b"hot").expect("publish");
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while hits.load(Ordering::SeqCst) < 100 && Instant::now() < deadline {
        Bus::global().pump(0);
        std::thread::yield_now();
    }
    assert_eq!(hits.load(Ordering::SeqCst), 100);
}
