//! Registration of the runtime APIs.
//!
//! Every operation the runtime exposes to modules is registered in the
//! [`ApiRegistry`] under a binding name and a frozen id, as a concrete
//! function-pointer type. The aliases below are the dispatchable signature
//! table; a module resolves an entry once and calls through it:
//!
//! ```
//! use imc_dispatch::{bus_api, ids, ApiRegistry};
//!
//! let registry = ApiRegistry::new();
//! bus_api::register_imc_apis(&registry);
//! let publish = registry.get_as::<bus_api::PublishFn>(ids::IMC_PUBLISH).expect("registered");
//! let topic = imc_bus::Bus::global().topic_id("example").expect("id");
//! publish(topic, b"hello").expect("publish");
//! imc_bus::Bus::shutdown_global();
//! ```

use std::sync::Arc;
use std::time::Duration;

use imc_bus::{
    Bus, BusCaps, BusStatsSnapshot, Envelope, FutureHandle, FutureState, MessageOptions,
    Payload, SubscribeOptions, SubscriberFn, SubscriptionHandle, SubscriptionStatsSnapshot,
    TopicInfo,
};
use imc_common::error::record_err;
use imc_common::{
    ApiId, ApiVersion, Capabilities, ExternalBuffer, LastError, Result, RpcId, TopicId,
    RUNTIME_API_VERSION,
};

use crate::ids;
use crate::registry::{ApiHandle, ApiMetadata, ApiRegistry};

// ---------------------------------------------------------------------------
// Dispatchable signatures
// ---------------------------------------------------------------------------

/// `imcGetTopicId`
pub type GetTopicIdFn = fn(&str) -> Result<TopicId>;
/// `imcGetRpcId`
pub type GetRpcIdFn = fn(&str) -> Result<RpcId>;
/// `imcPublish`
pub type PublishFn = fn(TopicId, &[u8]) -> Result<usize>;
/// `imcPublishEx`
pub type PublishExFn = fn(TopicId, &[u8], &MessageOptions) -> Result<usize>;
/// `imcPublishBuffer`
pub type PublishBufferFn = fn(TopicId, ExternalBuffer) -> Result<usize>;
/// `imcPublishMulti`
pub type PublishMultiFn = fn(&[TopicId], &[u8], &MessageOptions) -> Result<usize>;
/// `imcSubscribe`
pub type SubscribeFn = fn(TopicId, SubscriberFn) -> Result<SubscriptionHandle>;
/// `imcSubscribeEx`
pub type SubscribeExFn = fn(TopicId, SubscribeOptions, SubscriberFn) -> Result<SubscriptionHandle>;
/// `imcUnsubscribe`
pub type UnsubscribeFn = fn(SubscriptionHandle) -> Result<()>;
/// `imcSubscriptionIsActive`
pub type SubscriptionIsActiveFn = fn(SubscriptionHandle) -> bool;
/// `imcRegisterRpc`
pub type RegisterRpcFn = fn(RpcId, imc_bus::RpcHandlerFn) -> Result<()>;
/// `imcUnregisterRpc`
pub type UnregisterRpcFn = fn(RpcId) -> Result<()>;
/// `imcCallRpc`
pub type CallRpcFn = fn(RpcId, Payload) -> Result<FutureHandle>;
/// `imcFutureAwait`
pub type FutureAwaitFn = fn(FutureHandle, Option<Duration>) -> Result<FutureState>;
/// `imcFutureGetResult`
pub type FutureGetResultFn = fn(FutureHandle) -> Result<imc_bus::FutureResult>;
/// `imcFutureGetState`
pub type FutureGetStateFn = fn(FutureHandle) -> Result<FutureState>;
/// `imcFutureCancel`
pub type FutureCancelFn = fn(FutureHandle) -> Result<()>;
/// `imcFutureOnComplete`
pub type FutureOnCompleteFn = fn(FutureHandle, Box<dyn FnOnce(FutureState) + Send>) -> Result<()>;
/// `imcFutureRelease`
pub type FutureReleaseFn = fn(FutureHandle) -> Result<()>;
/// `imcGetCaps`
pub type GetCapsFn = fn() -> BusCaps;
/// `imcGetStats`
pub type GetStatsFn = fn() -> BusStatsSnapshot;
/// `imcResetStats`
pub type ResetStatsFn = fn();
/// `imcGetSubscriptionStats`
pub type GetSubscriptionStatsFn = fn(SubscriptionHandle) -> Result<SubscriptionStatsSnapshot>;
/// `imcGetTopicInfo`
pub type GetTopicInfoFn = fn(TopicId) -> Result<TopicInfo>;
/// `imcGetTopicName`
pub type GetTopicNameFn = fn(TopicId) -> Option<String>;
/// `imcPump`
pub type PumpFn = fn(usize) -> usize;

/// `getRuntimeVersion`
pub type GetRuntimeVersionFn = fn() -> ApiVersion;
/// `getLastError`
pub type GetLastErrorFn = fn() -> Option<LastError>;
/// `clearLastError`
pub type ClearLastErrorFn = fn();
/// `getProcAddress`
pub type GetProcAddressFn = fn(&str) -> Option<ApiHandle>;
/// `getProcAddressById`
pub type GetProcAddressByIdFn = fn(ApiId) -> Option<ApiHandle>;
/// `getApiId`
pub type GetApiIdFn = fn(&str) -> Option<ApiId>;
/// `hasCapability`
pub type HasCapabilityFn = fn(Capabilities) -> bool;
/// `getTotalCapabilities`
pub type GetTotalCapabilitiesFn = fn() -> Capabilities;

// ---------------------------------------------------------------------------
// Implementations, bound to the global instances
// ---------------------------------------------------------------------------

fn imc_get_topic_id(name: &str) -> Result<TopicId> {
    record_err("imcGetTopicId", Bus::global().topic_id(name))
}

fn imc_get_rpc_id(name: &str) -> Result<RpcId> {
    record_err("imcGetRpcId", Bus::global().rpc_id(name))
}

fn imc_publish(topic: TopicId, data: &[u8]) -> Result<usize> {
    record_err("imcPublish", Bus::global().publish(topic, data))
}

fn imc_publish_ex(topic: TopicId, data: &[u8], options: &MessageOptions) -> Result<usize> {
    record_err("imcPublishEx", Bus::global().publish_with(topic, data, options))
}

fn imc_publish_buffer(topic: TopicId, buffer: ExternalBuffer) -> Result<usize> {
    record_err("imcPublishBuffer", Bus::global().publish_buffer(topic, buffer))
}

fn imc_publish_multi(topics: &[TopicId], data: &[u8], options: &MessageOptions) -> Result<usize> {
    record_err("imcPublishMulti", Bus::global().publish_multi(topics, data, options))
}

fn imc_subscribe(topic: TopicId, handler: SubscriberFn) -> Result<SubscriptionHandle> {
    let bus = Bus::global();
    let result = bus.subscribe(topic, move |bus: &Bus, topic, envelope: &Envelope| {
        handler(bus, topic, envelope)
    });
    record_err("imcSubscribe", result)
}

fn imc_subscribe_ex(
    topic: TopicId,
    options: SubscribeOptions,
    handler: SubscriberFn,
) -> Result<SubscriptionHandle> {
    let bus = Bus::global();
    let result = bus.subscribe_with(topic, options, move |bus: &Bus, topic, envelope: &Envelope| {
        handler(bus, topic, envelope)
    });
    record_err("imcSubscribeEx", result)
}

fn imc_unsubscribe(handle: SubscriptionHandle) -> Result<()> {
    record_err("imcUnsubscribe", Bus::global().unsubscribe(handle))
}

fn imc_subscription_is_active(handle: SubscriptionHandle) -> bool {
    Bus::global().subscription_is_active(handle)
}

fn imc_register_rpc(id: RpcId, handler: imc_bus::RpcHandlerFn) -> Result<()> {
    let bus = Bus::global();
    let result = bus.register_rpc(id, move |bus: &Bus, id, request: &Envelope| {
        handler(bus, id, request)
    });
    record_err("imcRegisterRpc", result)
}

fn imc_unregister_rpc(id: RpcId) -> Result<()> {
    record_err("imcUnregisterRpc", Bus::global().unregister_rpc(id))
}

fn imc_call_rpc(id: RpcId, request: Payload) -> Result<FutureHandle> {
    record_err("imcCallRpc", Bus::global().call_rpc(id, request))
}

fn imc_future_await(handle: FutureHandle, timeout: Option<Duration>) -> Result<FutureState> {
    record_err("imcFutureAwait", Bus::global().future_wait(handle, timeout))
}

fn imc_future_get_result(handle: FutureHandle) -> Result<imc_bus::FutureResult> {
    record_err("imcFutureGetResult", Bus::global().future_result(handle))
}

fn imc_future_get_state(handle: FutureHandle) -> Result<FutureState> {
    record_err("imcFutureGetState", Bus::global().future_state(handle))
}

fn imc_future_cancel(handle: FutureHandle) -> Result<()> {
    record_err("imcFutureCancel", Bus::global().future_cancel(handle))
}

fn imc_future_on_complete(
    handle: FutureHandle,
    callback: Box<dyn FnOnce(FutureState) + Send>,
) -> Result<()> {
    record_err(
        "imcFutureOnComplete",
        Bus::global().future_on_complete(handle, callback),
    )
}

fn imc_future_release(handle: FutureHandle) -> Result<()> {
    record_err("imcFutureRelease", Bus::global().future_release(handle))
}

fn imc_get_caps() -> BusCaps {
    Bus::global().caps()
}

fn imc_get_stats() -> BusStatsSnapshot {
    Bus::global().stats()
}

fn imc_reset_stats() {
    Bus::global().reset_stats();
}

fn imc_get_subscription_stats(handle: SubscriptionHandle) -> Result<SubscriptionStatsSnapshot> {
    record_err("imcGetSubscriptionStats", Bus::global().subscription_stats(handle))
}

fn imc_get_topic_info(topic: TopicId) -> Result<TopicInfo> {
    record_err("imcGetTopicInfo", Bus::global().topic_info(topic))
}

fn imc_get_topic_name(topic: TopicId) -> Option<String> {
    Bus::global().topic_name(topic)
}

fn imc_pump(max_per_subscription: usize) -> usize {
    Bus::global().pump(max_per_subscription)
}

fn get_runtime_version() -> ApiVersion {
    RUNTIME_API_VERSION
}

fn get_last_error() -> Option<LastError> {
    LastError::current()
}

fn clear_last_error() {
    LastError::clear();
}

fn get_proc_address(name: &str) -> Option<ApiHandle> {
    ApiRegistry::global().get(name)
}

fn get_proc_address_by_id(id: ApiId) -> Option<ApiHandle> {
    ApiRegistry::global().get_by_id_cached(id)
}

fn get_api_id(name: &str) -> Option<ApiId> {
    ApiRegistry::global().api_id_of(name)
}

fn has_capability(required: Capabilities) -> bool {
    ApiRegistry::global().has_capability(required)
}

fn get_total_capabilities() -> Capabilities {
    ApiRegistry::global().total_capabilities()
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

fn entry<T: Send + Sync + 'static>(
    registry: &ApiRegistry,
    name: &'static str,
    id: ApiId,
    capabilities: Capabilities,
    value: T,
) {
    registry.register(ApiMetadata::core(name, id, capabilities), Arc::new(value));
}

/// Registers the core lifecycle and error APIs.
pub fn register_lifecycle_apis(registry: &ApiRegistry) {
    entry(
        registry,
        "getRuntimeVersion",
        ids::GET_RUNTIME_VERSION,
        Capabilities::empty(),
        get_runtime_version as GetRuntimeVersionFn,
    );
    entry(
        registry,
        "getLastError",
        ids::GET_LAST_ERROR,
        Capabilities::DIAGNOSTICS,
        get_last_error as GetLastErrorFn,
    );
    entry(
        registry,
        "clearLastError",
        ids::CLEAR_LAST_ERROR,
        Capabilities::DIAGNOSTICS,
        clear_last_error as ClearLastErrorFn,
    );
    entry(
        registry,
        "getProcAddress",
        ids::GET_PROC_ADDRESS,
        Capabilities::empty(),
        get_proc_address as GetProcAddressFn,
    );
    entry(
        registry,
        "getProcAddressById",
        ids::GET_PROC_ADDRESS_BY_ID,
        Capabilities::IMC_ID_BASED,
        get_proc_address_by_id as GetProcAddressByIdFn,
    );
    entry(
        registry,
        "getApiId",
        ids::GET_API_ID,
        Capabilities::IMC_ID_BASED,
        get_api_id as GetApiIdFn,
    );
}

/// Registers the capability query APIs.
pub fn register_capability_apis(registry: &ApiRegistry) {
    entry(
        registry,
        "hasCapability",
        ids::HAS_CAPABILITY,
        Capabilities::CAPABILITY_QUERY,
        has_capability as HasCapabilityFn,
    );
    entry(
        registry,
        "getTotalCapabilities",
        ids::GET_TOTAL_CAPABILITIES,
        Capabilities::CAPABILITY_QUERY,
        get_total_capabilities as GetTotalCapabilitiesFn,
    );
}

/// Registers every messaging API against the global bus.
pub fn register_imc_apis(registry: &ApiRegistry) {
    use Capabilities as C;

    entry(registry, "imcGetTopicId", ids::IMC_GET_TOPIC_ID, C::IMC_BASIC | C::IMC_ID_BASED, imc_get_topic_id as GetTopicIdFn);
    entry(registry, "imcGetRpcId", ids::IMC_GET_RPC_ID, C::IMC_RPC | C::IMC_ID_BASED, imc_get_rpc_id as GetRpcIdFn);

    entry(registry, "imcPublish", ids::IMC_PUBLISH, C::IMC_BASIC, imc_publish as PublishFn);
    entry(registry, "imcPublishEx", ids::IMC_PUBLISH_EX, C::IMC_BASIC | C::IMC_PRIORITY, imc_publish_ex as PublishExFn);
    entry(registry, "imcPublishBuffer", ids::IMC_PUBLISH_BUFFER, C::IMC_BASIC | C::IMC_BUFFER | C::IMC_SHARED_FANOUT, imc_publish_buffer as PublishBufferFn);
    entry(registry, "imcPublishMulti", ids::IMC_PUBLISH_MULTI, C::IMC_BASIC, imc_publish_multi as PublishMultiFn);
    entry(registry, "imcSubscribe", ids::IMC_SUBSCRIBE, C::IMC_BASIC, imc_subscribe as SubscribeFn);
    entry(registry, "imcSubscribeEx", ids::IMC_SUBSCRIBE_EX, C::IMC_BASIC | C::IMC_PRIORITY, imc_subscribe_ex as SubscribeExFn);
    entry(registry, "imcUnsubscribe", ids::IMC_UNSUBSCRIBE, C::IMC_BASIC, imc_unsubscribe as UnsubscribeFn);
    entry(registry, "imcSubscriptionIsActive", ids::IMC_SUBSCRIPTION_IS_ACTIVE, C::IMC_BASIC, imc_subscription_is_active as SubscriptionIsActiveFn);

    entry(registry, "imcRegisterRpc", ids::IMC_REGISTER_RPC, C::IMC_RPC, imc_register_rpc as RegisterRpcFn);
    entry(registry, "imcUnregisterRpc", ids::IMC_UNREGISTER_RPC, C::IMC_RPC, imc_unregister_rpc as UnregisterRpcFn);
    entry(registry, "imcCallRpc", ids::IMC_CALL_RPC, C::IMC_RPC | C::IMC_FUTURE, imc_call_rpc as CallRpcFn);

    entry(registry, "imcFutureAwait", ids::IMC_FUTURE_AWAIT, C::IMC_FUTURE, imc_future_await as FutureAwaitFn);
    entry(registry, "imcFutureGetResult", ids::IMC_FUTURE_GET_RESULT, C::IMC_FUTURE, imc_future_get_result as FutureGetResultFn);
    entry(registry, "imcFutureGetState", ids::IMC_FUTURE_GET_STATE, C::IMC_FUTURE, imc_future_get_state as FutureGetStateFn);
    entry(registry, "imcFutureCancel", ids::IMC_FUTURE_CANCEL, C::IMC_FUTURE, imc_future_cancel as FutureCancelFn);
    entry(registry, "imcFutureOnComplete", ids::IMC_FUTURE_ON_COMPLETE, C::IMC_FUTURE, imc_future_on_complete as FutureOnCompleteFn);
    entry(registry, "imcFutureRelease", ids::IMC_FUTURE_RELEASE, C::IMC_FUTURE, imc_future_release as FutureReleaseFn);

    entry(registry, "imcGetCaps", ids::IMC_GET_CAPS, C::IMC_BASIC, imc_get_caps as GetCapsFn);
    entry(registry, "imcGetStats", ids::IMC_GET_STATS, C::IMC_BASIC | C::STATISTICS, imc_get_stats as GetStatsFn);
    entry(registry, "imcResetStats", ids::IMC_RESET_STATS, C::IMC_BASIC | C::STATISTICS, imc_reset_stats as ResetStatsFn);
    entry(registry, "imcGetSubscriptionStats", ids::IMC_GET_SUBSCRIPTION_STATS, C::IMC_BASIC | C::STATISTICS, imc_get_subscription_stats as GetSubscriptionStatsFn);
    entry(registry, "imcGetTopicInfo", ids::IMC_GET_TOPIC_INFO, C::IMC_BASIC, imc_get_topic_info as GetTopicInfoFn);
    entry(registry, "imcGetTopicName", ids::IMC_GET_TOPIC_NAME, C::IMC_BASIC, imc_get_topic_name as GetTopicNameFn);

    entry(registry, "imcPump", ids::IMC_PUMP, C::IMC_DISPATCH, imc_pump as PumpFn);
}
