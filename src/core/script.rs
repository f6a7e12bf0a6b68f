//! Scriptable hook engine
//!
//! Hooks are compiled trait objects implementing [`ScriptHook`]; the engine
//! hosts them behind a fixed, narrow [`ScriptCtx`] surface (state map,
//! logging, sleeping, background tasks, register access, event emission).
//! A hook that returns an error is logged, reported on the event bus, and
//! degraded to pass-through - a buggy script never halts the pipeline.
//! The hook table swaps atomically, so hot reload lands between requests,
//! never mid-request.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::events::{EventBus, EventKind};
use crate::core::pdu::{DataKind, Request, Response};
use crate::utils::error::{Result, UmdtError};

/// Scalar values a script may keep in its state map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ScalarValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScalarValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScalarValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// What a request-stage hook wants done with the request.
#[derive(Debug, Clone)]
pub enum HookOutcome {
    /// Continue with this (possibly mutated) request
    Forward(Request),
    /// Short-circuit: answer the caller with a Modbus exception
    Exception(u8),
    /// Silently discard; no reply is sent
    Drop,
}

/// What a response-stage hook wants done with the response.
#[derive(Debug, Clone)]
pub enum ResponseOutcome {
    Forward(Response),
    Drop,
}

/// Register access handed to server-side scripts.
#[async_trait]
pub trait RegisterAccess: Send + Sync {
    async fn read_one(&self, kind: DataKind, address: u16) -> Result<u16>;
    async fn write_one(&self, kind: DataKind, address: u16, value: u16) -> Result<()>;
}

/// The capability set scripts implement. Every entry point has a
/// pass-through default, so a hook implements only what it cares about.
///
/// Server-side engines call `on_request`/`on_response`/`on_write`; bridge
/// engines call `ingress`/`egress`/`response`/`upstream_response`. Both call
/// the lifecycle and periodic entries.
#[async_trait]
pub trait ScriptHook: Send + Sync {
    fn name(&self) -> &str;

    async fn on_start(&self, _ctx: &ScriptCtx) -> Result<()> {
        Ok(())
    }

    async fn on_stop(&self, _ctx: &ScriptCtx) -> Result<()> {
        Ok(())
    }

    async fn on_periodic(&self, _ctx: &ScriptCtx) -> Result<()> {
        Ok(())
    }

    async fn on_request(&self, request: Request, _ctx: &ScriptCtx) -> Result<HookOutcome> {
        Ok(HookOutcome::Forward(request))
    }

    async fn on_response(&self, response: Response, _ctx: &ScriptCtx) -> Result<ResponseOutcome> {
        Ok(ResponseOutcome::Forward(response))
    }

    /// Notification after a server-side write has been applied.
    async fn on_write(
        &self,
        _unit: u8,
        _address: u16,
        _value: u16,
        _ctx: &ScriptCtx,
    ) -> Result<()> {
        Ok(())
    }

    async fn ingress(&self, request: Request, _ctx: &ScriptCtx) -> Result<HookOutcome> {
        Ok(HookOutcome::Forward(request))
    }

    async fn egress(&self, request: Request, _ctx: &ScriptCtx) -> Result<HookOutcome> {
        Ok(HookOutcome::Forward(request))
    }

    async fn response(&self, response: Response, _ctx: &ScriptCtx) -> Result<ResponseOutcome> {
        Ok(ResponseOutcome::Forward(response))
    }

    async fn upstream_response(
        &self,
        response: Response,
        _ctx: &ScriptCtx,
    ) -> Result<ResponseOutcome> {
        Ok(ResponseOutcome::Forward(response))
    }
}

/// Context object passed to every hook invocation.
pub struct ScriptCtx {
    engine_name: String,
    state: Mutex<HashMap<String, ScalarValue>>,
    events: EventBus,
    registers: RwLock<Option<Arc<dyn RegisterAccess>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ScriptCtx {
    fn new(engine_name: String, events: EventBus) -> Self {
        Self {
            engine_name,
            state: Mutex::new(HashMap::new()),
            events,
            registers: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    // --- state map ---

    pub fn get(&self, key: &str) -> Option<ScalarValue> {
        self.state.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: ScalarValue) {
        self.state.lock().insert(key.into(), value);
    }

    pub fn state_snapshot(&self) -> HashMap<String, ScalarValue> {
        self.state.lock().clone()
    }

    pub fn clear_state(&self) {
        self.state.lock().clear();
    }

    // --- logging ---

    pub fn log_debug(&self, msg: &str) {
        debug!(target: "umdt::script", "[{}] {}", self.engine_name, msg);
    }

    pub fn log_info(&self, msg: &str) {
        tracing::info!(target: "umdt::script", "[{}] {}", self.engine_name, msg);
    }

    pub fn log_warning(&self, msg: &str) {
        warn!(target: "umdt::script", "[{}] {}", self.engine_name, msg);
    }

    pub fn log_error(&self, msg: &str) {
        tracing::error!(target: "umdt::script", "[{}] {}", self.engine_name, msg);
    }

    // --- scheduling ---

    /// Cooperative sleep.
    pub async fn sleep(&self, seconds: f64) {
        tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
    }

    /// Spawn a managed background task; cancelled when the engine stops.
    pub fn schedule_task<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().push(tokio::spawn(future));
    }

    // --- Modbus helpers ---

    /// Build an exception response matching `request`.
    pub fn make_response_exception(&self, request: &Request, code: u8) -> Response {
        Response::exception_for(request, code)
    }

    /// Publish a script event on the bus.
    pub fn emit_event(&self, name: &str, payload: serde_json::Value) {
        self.events.publish(
            EventKind::Script,
            json!({"engine": self.engine_name, "name": name, "payload": payload}),
        );
    }

    /// Read one register/bit from the hosting server (server-side only).
    pub async fn read_register(&self, kind: DataKind, address: u16) -> Result<u16> {
        let access = self.registers.read().clone();
        match access {
            Some(access) => access.read_one(kind, address).await,
            None => Err(UmdtError::script(
                "register access is not available in this engine",
            )),
        }
    }

    /// Write one register/bit on the hosting server (server-side only).
    pub async fn write_register(&self, kind: DataKind, address: u16, value: u16) -> Result<()> {
        let access = self.registers.read().clone();
        match access {
            Some(access) => access.write_one(kind, address, value).await,
            None => Err(UmdtError::script(
                "register access is not available in this engine",
            )),
        }
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Invocation counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptStats {
    pub request_hooks_invoked: u64,
    pub response_hooks_invoked: u64,
    pub exceptions_returned: u64,
    pub drops: u64,
    pub errors: u64,
}

/// Which request-stage entry point to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestStage {
    ServerRequest,
    Ingress,
    Egress,
}

/// Which response-stage entry point to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseStage {
    ServerResponse,
    Response,
    UpstreamResponse,
}

/// Hosts an ordered set of hooks and runs them with error downgrade.
pub struct ScriptEngine {
    name: String,
    ctx: Arc<ScriptCtx>,
    events: EventBus,
    table: RwLock<Arc<Vec<Arc<dyn ScriptHook>>>>,
    stats: Mutex<ScriptStats>,
    grace: Duration,
}

impl ScriptEngine {
    pub fn new(name: impl Into<String>, events: EventBus) -> Arc<Self> {
        let name = name.into();
        Arc::new(Self {
            ctx: Arc::new(ScriptCtx::new(name.clone(), events.clone())),
            name,
            events,
            table: RwLock::new(Arc::new(Vec::new())),
            stats: Mutex::new(ScriptStats::default()),
            grace: Duration::from_secs(2),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ctx(&self) -> Arc<ScriptCtx> {
        Arc::clone(&self.ctx)
    }

    /// Attach server register access to the context.
    pub fn set_register_access(&self, access: Arc<dyn RegisterAccess>) {
        *self.ctx.registers.write() = Some(access);
    }

    /// Append a hook to the table (atomic swap).
    pub fn register(&self, hook: Arc<dyn ScriptHook>) {
        let mut table = self.table.write();
        let mut next = (**table).clone();
        next.push(hook);
        *table = Arc::new(next);
    }

    /// Replace the whole hook table (hot reload). In-flight requests keep
    /// the table they started with.
    pub fn replace_hooks(&self, hooks: Vec<Arc<dyn ScriptHook>>) {
        *self.table.write() = Arc::new(hooks);
    }

    pub fn hook_count(&self) -> usize {
        self.table.read().len()
    }

    pub fn stats(&self) -> ScriptStats {
        self.stats.lock().clone()
    }

    fn snapshot(&self) -> Arc<Vec<Arc<dyn ScriptHook>>> {
        Arc::clone(&self.table.read())
    }

    fn note_error(&self, hook: &str, stage: &str, err: &UmdtError) {
        self.stats.lock().errors += 1;
        warn!(
            "[ScriptEngine:{}] hook '{}' failed in {}: {} (pass-through)",
            self.name, hook, stage, err
        );
        self.events.publish(
            EventKind::Script,
            json!({
                "engine": self.name,
                "hook": hook,
                "stage": stage,
                "error": err.to_string(),
            }),
        );
    }

    async fn run_request_stage(&self, stage: RequestStage, mut request: Request) -> HookOutcome {
        self.stats.lock().request_hooks_invoked += 1;
        let stage_name = match stage {
            RequestStage::ServerRequest => "on_request",
            RequestStage::Ingress => "ingress",
            RequestStage::Egress => "egress",
        };

        for hook in self.snapshot().iter() {
            let attempt = request.clone();
            let result = match stage {
                RequestStage::ServerRequest => hook.on_request(attempt, &self.ctx).await,
                RequestStage::Ingress => hook.ingress(attempt, &self.ctx).await,
                RequestStage::Egress => hook.egress(attempt, &self.ctx).await,
            };
            match result {
                Ok(HookOutcome::Forward(next)) => request = next,
                Ok(HookOutcome::Exception(code)) => {
                    self.stats.lock().exceptions_returned += 1;
                    return HookOutcome::Exception(code);
                }
                Ok(HookOutcome::Drop) => {
                    self.stats.lock().drops += 1;
                    return HookOutcome::Drop;
                }
                Err(e) => self.note_error(hook.name(), stage_name, &e),
            }
        }
        HookOutcome::Forward(request)
    }

    async fn run_response_stage(
        &self,
        stage: ResponseStage,
        mut response: Response,
    ) -> Option<Response> {
        self.stats.lock().response_hooks_invoked += 1;
        let stage_name = match stage {
            ResponseStage::ServerResponse => "on_response",
            ResponseStage::Response => "response",
            ResponseStage::UpstreamResponse => "upstream_response",
        };

        for hook in self.snapshot().iter() {
            let attempt = response.clone();
            let result = match stage {
                ResponseStage::ServerResponse => hook.on_response(attempt, &self.ctx).await,
                ResponseStage::Response => hook.response(attempt, &self.ctx).await,
                ResponseStage::UpstreamResponse => {
                    hook.upstream_response(attempt, &self.ctx).await
                }
            };
            match result {
                Ok(ResponseOutcome::Forward(next)) => response = next,
                Ok(ResponseOutcome::Drop) => {
                    self.stats.lock().drops += 1;
                    return None;
                }
                Err(e) => self.note_error(hook.name(), stage_name, &e),
            }
        }
        Some(response)
    }

    // --- server-side entry points ---

    pub async fn server_request(&self, request: Request) -> HookOutcome {
        self.run_request_stage(RequestStage::ServerRequest, request).await
    }

    pub async fn server_response(&self, response: Response) -> Option<Response> {
        self.run_response_stage(ResponseStage::ServerResponse, response)
            .await
    }

    pub async fn notify_write(&self, unit: u8, address: u16, value: u16) {
        for hook in self.snapshot().iter() {
            if let Err(e) = hook.on_write(unit, address, value, &self.ctx).await {
                self.note_error(hook.name(), "on_write", &e);
            }
        }
    }

    // --- bridge-side entry points ---

    pub async fn ingress(&self, request: Request) -> HookOutcome {
        self.run_request_stage(RequestStage::Ingress, request).await
    }

    pub async fn egress(&self, request: Request) -> HookOutcome {
        self.run_request_stage(RequestStage::Egress, request).await
    }

    pub async fn response(&self, response: Response) -> Option<Response> {
        self.run_response_stage(ResponseStage::Response, response)
            .await
    }

    pub async fn upstream_response(&self, response: Response) -> Option<Response> {
        self.run_response_stage(ResponseStage::UpstreamResponse, response)
            .await
    }

    // --- lifecycle ---

    pub async fn start(&self) {
        for hook in self.snapshot().iter() {
            if let Err(e) = hook.on_start(&self.ctx).await {
                self.note_error(hook.name(), "on_start", &e);
            }
        }
    }

    /// Run `on_stop` under the grace period, then cancel scheduled tasks.
    pub async fn stop(&self) {
        let hooks = self.snapshot();
        let ctx = Arc::clone(&self.ctx);
        let stop_all = async {
            for hook in hooks.iter() {
                if let Err(e) = hook.on_stop(&ctx).await {
                    self.note_error(hook.name(), "on_stop", &e);
                }
            }
        };
        if tokio::time::timeout(self.grace, stop_all).await.is_err() {
            warn!(
                "[ScriptEngine:{}] on_stop exceeded {:?} grace period",
                self.name, self.grace
            );
        }
        self.ctx.abort_tasks();
    }

    pub async fn periodic(&self) {
        for hook in self.snapshot().iter() {
            if let Err(e) = hook.on_periodic(&self.ctx).await {
                self.note_error(hook.name(), "on_periodic", &e);
            }
        }
    }

    /// Fire `on_periodic` every `interval` until the returned handle is
    /// aborted.
    pub fn spawn_periodic(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.periodic().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::ModbusMode;

    fn request() -> Request {
        Request {
            unit_id: 1,
            function: 0x03,
            payload: vec![0x00, 0x64, 0x00, 0x01],
            transaction_id: Some(9),
            mode: ModbusMode::Tcp,
            raw: vec![],
        }
    }

    /// Remaps addresses down by 1000 for FC 03.
    struct RemapHook;

    #[async_trait]
    impl ScriptHook for RemapHook {
        fn name(&self) -> &str {
            "remap"
        }
        async fn ingress(&self, mut request: Request, _ctx: &ScriptCtx) -> Result<HookOutcome> {
            if request.function == 0x03 {
                if let Some(addr) = request.address() {
                    request.set_address(addr - 50);
                }
            }
            Ok(HookOutcome::Forward(request))
        }
    }

    /// Always fails.
    struct BrokenHook;

    #[async_trait]
    impl ScriptHook for BrokenHook {
        fn name(&self) -> &str {
            "broken"
        }
        async fn ingress(&self, _request: Request, _ctx: &ScriptCtx) -> Result<HookOutcome> {
            Err(UmdtError::script("deliberate failure"))
        }
        async fn on_request(&self, _request: Request, _ctx: &ScriptCtx) -> Result<HookOutcome> {
            Err(UmdtError::script("deliberate failure"))
        }
    }

    /// Rejects writes while `SYSTEM_READY` is unset.
    struct InterlockHook;

    #[async_trait]
    impl ScriptHook for InterlockHook {
        fn name(&self) -> &str {
            "interlock"
        }
        async fn on_request(&self, request: Request, ctx: &ScriptCtx) -> Result<HookOutcome> {
            if request.function == 0x06
                && ctx.get("SYSTEM_READY").and_then(|v| v.as_bool()) != Some(true)
            {
                return Ok(HookOutcome::Exception(0x02));
            }
            Ok(HookOutcome::Forward(request))
        }
    }

    #[tokio::test]
    async fn test_ingress_mutation() {
        let engine = ScriptEngine::new("test", EventBus::default());
        engine.register(Arc::new(RemapHook));
        match engine.ingress(request()).await {
            HookOutcome::Forward(req) => assert_eq!(req.address(), Some(50)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broken_hook_degrades_to_passthrough() {
        let engine = ScriptEngine::new("test", EventBus::default());
        engine.register(Arc::new(BrokenHook));
        engine.register(Arc::new(RemapHook));
        // The broken hook is skipped; the remap hook still runs.
        match engine.ingress(request()).await {
            HookOutcome::Forward(req) => assert_eq!(req.address(), Some(50)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(engine.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_interlock_state_gate() {
        let engine = ScriptEngine::new("test", EventBus::default());
        engine.register(Arc::new(InterlockHook));

        let write = Request {
            function: 0x06,
            ..request()
        };
        match engine.server_request(write.clone()).await {
            HookOutcome::Exception(code) => assert_eq!(code, 0x02),
            other => panic!("unexpected {other:?}"),
        }

        engine.ctx().set("SYSTEM_READY", ScalarValue::Bool(true));
        match engine.server_request(write).await {
            HookOutcome::Forward(_) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hot_reload_swaps_table() {
        let engine = ScriptEngine::new("test", EventBus::default());
        engine.register(Arc::new(RemapHook));
        assert_eq!(engine.hook_count(), 1);
        engine.replace_hooks(vec![]);
        assert_eq!(engine.hook_count(), 0);
        match engine.ingress(request()).await {
            HookOutcome::Forward(req) => assert_eq!(req.address(), Some(100)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_scheduled_tasks_cancelled_on_stop() {
        let engine = ScriptEngine::new("test", EventBus::default());
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag2 = Arc::clone(&flag);
        engine.ctx().schedule_task(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            flag2.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        engine.stop().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!flag.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_ctx_register_access_unavailable() {
        let engine = ScriptEngine::new("bridge", EventBus::default());
        let err = engine
            .ctx()
            .read_register(DataKind::Holding, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, UmdtError::Script(_)));
    }
}
