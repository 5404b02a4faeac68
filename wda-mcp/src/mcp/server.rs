//! Request dispatch and session bookkeeping for the tool server.
//!
//! [`ToolServer::handle_line`] is synchronous and thread-safe: the transport
//! calls it from blocking worker threads, one per request, so a long build
//! never stalls `ping` or cancellation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use anyhow::Result;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::session::SessionState;
use crate::error::ToolError;
use crate::io::config::ServerConfig;
use crate::io::process::CancelToken;
use crate::io::profiles::{list_profiles, resolve_profile, resolve_profiles_dir};
use crate::mcp::protocol::{INTERNAL_ERROR, Request, Response, RpcError, parse_request};
use crate::mcp::tools::{
    BUILD_AND_SIGN, BuildAndSignArgs, IS_FREE_ACCOUNT, IsFreeAccountArgs, LIST_PROFILES,
    ToolCatalog, ToolResult, decode_args,
};
use crate::pipeline::{Backends, PipelineRequest, run_pipeline};

pub const SERVER_NAME: &str = "wda-mcp-server";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub struct ToolServer {
    config: ServerConfig,
    backends: Backends,
    catalog: ToolCatalog,
    session: Mutex<SessionState>,
    /// Held for the duration of a pipeline run.
    pipeline: Mutex<()>,
    in_flight: Mutex<InFlight>,
}

/// Cancellation tokens of running requests.
///
/// Entries are keyed by registration slot, so two requests reusing one id are
/// both cancelled by it. Once `cancel_all` has run, new registrations start
/// out cancelled.
#[derive(Debug, Default)]
struct InFlight {
    next_slot: u64,
    requests: HashMap<u64, (String, CancelToken)>,
    shutting_down: bool,
}

impl InFlight {
    fn register(&mut self, key: String) -> (u64, CancelToken) {
        let token = CancelToken::new();
        if self.shutting_down {
            token.cancel();
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        self.requests.insert(slot, (key, token.clone()));
        (slot, token)
    }

    fn finish(&mut self, slot: u64) {
        self.requests.remove(&slot);
    }

    fn cancel(&self, key: &str) -> usize {
        let mut cancelled = 0;
        for (_, token) in self.requests.values().filter(|(id, _)| id == key) {
            token.cancel();
            cancelled += 1;
        }
        cancelled
    }

    fn cancel_all(&mut self) -> usize {
        self.shutting_down = true;
        for (_, token) in self.requests.values() {
            token.cancel();
        }
        self.requests.len()
    }
}

impl ToolServer {
    pub fn new(config: ServerConfig, backends: Backends) -> Result<Self> {
        Ok(Self {
            config,
            backends,
            catalog: ToolCatalog::new()?,
            session: Mutex::new(SessionState::default()),
            pipeline: Mutex::new(()),
            in_flight: Mutex::new(InFlight::default()),
        })
    }

    /// Snapshot of the session state.
    pub fn session(&self) -> SessionState {
        lock(&self.session).clone()
    }

    /// Number of requests currently being handled.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).requests.len()
    }

    /// Cancel every in-flight request, and every request that arrives later.
    pub fn cancel_all(&self) {
        let count = lock(&self.in_flight).cancel_all();
        if count > 0 {
            info!(count, "cancelled in-flight requests");
        }
    }

    /// Handle one line of input. Returns the response line, or `None` for
    /// notifications and blank lines.
    pub fn handle_line(&self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let response = match parse_request(line) {
            Ok(request) => self.handle_request(request)?,
            Err(response) => response,
        };
        Some(encode(&response))
    }

    fn handle_request(&self, request: Request) -> Option<Response> {
        let Some(id) = request.id.clone() else {
            self.handle_notification(&request);
            return None;
        };
        let (slot, cancel) = lock(&self.in_flight).register(id.to_string());
        let outcome = self.dispatch(&request, &cancel);
        lock(&self.in_flight).finish(slot);

        Some(match outcome {
            Ok(result) => Response::success(id, result),
            Err(error) => Response::failure(id, error),
        })
    }

    fn handle_notification(&self, request: &Request) {
        match request.method.as_str() {
            "notifications/cancelled" => {
                let Some(target) = request.params.get("requestId") else {
                    warn!("cancellation without requestId");
                    return;
                };
                match lock(&self.in_flight).cancel(&target.to_string()) {
                    0 => debug!(request_id = %target, "cancellation for unknown request"),
                    count => info!(request_id = %target, count, "cancelling request"),
                }
            }
            other => debug!(method = other, "ignoring notification"),
        }
    }

    #[instrument(skip_all, fields(method = %request.method))]
    fn dispatch(&self, request: &Request, cancel: &CancelToken) -> Result<Value, RpcError> {
        match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": request
                    .params
                    .get("protocolVersion")
                    .and_then(Value::as_str)
                    .unwrap_or(PROTOCOL_VERSION),
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": self.catalog.specs() })),
            "tools/call" => {
                let name = request
                    .params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::invalid_params("tools/call requires a tool name"))?;
                let args = request
                    .params
                    .get("arguments")
                    .cloned()
                    .unwrap_or(Value::Null);
                self.call_tool(name, args, cancel)
            }
            method if self.catalog.contains(method) => {
                self.call_tool(method, request.params.clone(), cancel)
            }
            method => Err(RpcError::method_not_found(method)),
        }
    }

    fn call_tool(&self, name: &str, args: Value, cancel: &CancelToken) -> Result<Value, RpcError> {
        if !self.catalog.contains(name) {
            return Err(RpcError::method_not_found(name));
        }
        let args = if args.is_null() { json!({}) } else { args };
        let result = match self.run_tool(name, args, cancel) {
            Ok(value) => ToolResult::json(value),
            Err(err) => {
                warn!(tool = name, kind = err.kind(), err = %err, "tool failed");
                ToolResult::error(&err)
            }
        };
        serde_json::to_value(result)
            .map_err(|err| RpcError::new(INTERNAL_ERROR, format!("encode tool result: {err}")))
    }

    fn run_tool(&self, name: &str, args: Value, cancel: &CancelToken) -> Result<Value, ToolError> {
        self.catalog.validate(name, &args)?;
        match name {
            LIST_PROFILES => self.list_provisioning_profiles(),
            IS_FREE_ACCOUNT => self.is_free_account(decode_args(name, args)?),
            BUILD_AND_SIGN => self.build_and_sign_wda(decode_args(name, args)?, cancel),
            other => Err(ToolError::MethodNotFound(other.to_string())),
        }
    }

    fn list_provisioning_profiles(&self) -> Result<Value, ToolError> {
        let dir = resolve_profiles_dir(&self.config, self.backends.xcode.as_ref())?;
        let profiles = list_profiles(&dir)?;
        lock(&self.session).record_listing(profiles.clone());
        Ok(json!({
            "message": "Please select a provisioning profile",
            "profilesDir": dir,
            "profiles": profiles,
            "instructions": "Ask the user to choose a profile, then call is_free_account with its UUID and the account type",
        }))
    }

    fn is_free_account(&self, args: IsFreeAccountArgs) -> Result<Value, ToolError> {
        let mut session = lock(&self.session);
        session.confirm_account_type(args.is_free_account, args.profile_uuid.as_deref())?;
        let message = if args.is_free_account {
            "Recorded a free account"
        } else {
            "Recorded a paid or enterprise account"
        };
        Ok(json!({
            "message": message,
            "isFreeAccount": args.is_free_account,
            "selectedProfileUuid": session.selected_profile.as_ref().map(|p| p.uuid.clone()),
            "instructions": "Call build_and_sign_wda with the selected profile and account type",
        }))
    }

    fn build_and_sign_wda(
        &self,
        args: BuildAndSignArgs,
        cancel: &CancelToken,
    ) -> Result<Value, ToolError> {
        let _running = match self.pipeline.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(ToolError::Busy),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let request = self.pipeline_request(args)?;
        let result = run_pipeline(
            &self.config,
            self.backends.builder.as_ref(),
            self.backends.signer.as_ref(),
            &request,
            cancel,
        );

        let mut session = lock(&self.session);
        match result {
            Ok(outcome) => {
                session.record_success(outcome.project_path.clone());
                let mut value = serde_json::to_value(&outcome)
                    .map_err(|err| ToolError::Signing(format!("encode result: {err}")))?;
                if let Value::Object(map) = &mut value {
                    map.insert(
                        "message".to_string(),
                        json!("WebDriverAgent successfully built and signed"),
                    );
                }
                Ok(value)
            }
            Err(err) => {
                // Rejected arguments never started a stage.
                if !matches!(err, ToolError::Validation(_)) {
                    session.record_failure();
                }
                Err(err)
            }
        }
    }

    /// Merge explicit arguments with session state. Explicit values win.
    fn pipeline_request(&self, args: BuildAndSignArgs) -> Result<PipelineRequest, ToolError> {
        let session = self.session();
        let profile = match args.profile_path() {
            Some(path) => resolve_profile(Some(&path))?,
            None => session.selected_profile.clone().ok_or_else(|| {
                ToolError::validation(
                    "no provisioning profile selected; pass profilePath or call is_free_account with profileUuid",
                )
            })?,
        };
        let is_free_account = args
            .is_free_account
            .or(session.is_free_account)
            .ok_or_else(|| {
                ToolError::validation(
                    "account type not confirmed; pass isFreeAccount or call is_free_account",
                )
            })?;
        Ok(PipelineRequest {
            profile,
            project_path: args.project_path.or(session.project_path),
            is_free_account,
            bundle_id: args.bundle_id,
            output_path: args.output_path,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn encode(response: &Response) -> String {
    serde_json::to_string(response).unwrap_or_else(|err| {
        warn!(err = %err, "failed to encode response");
        json!({
            "jsonrpc": "2.0",
            "id": response.id,
            "error": { "code": INTERNAL_ERROR, "message": "failed to encode response" },
        })
        .to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::SessionPhase;
    use crate::mcp::protocol::METHOD_NOT_FOUND;
    use crate::test_support::{
        FixedXcode, ScriptedBuild, ScriptedBuildRunner, ScriptedSign, ScriptedSigner,
        write_profile,
    };
    use std::path::Path;
    use std::thread;
    use std::time::{Duration, Instant};

    fn server(root: &Path, builds: Vec<ScriptedBuild>, signs: Vec<ScriptedSign>) -> ToolServer {
        let config = ServerConfig {
            profiles_dir: Some(root.join("profiles")),
            project_search_root: Some(root.to_path_buf()),
            ..ServerConfig::default()
        };
        let backends = Backends {
            xcode: Box::new(FixedXcode(Ok(16))),
            builder: Box::new(ScriptedBuildRunner::new(builds)),
            signer: Box::new(ScriptedSigner::new(signs)),
        };
        ToolServer::new(config, backends).expect("server")
    }

    fn call(server: &ToolServer, id: u64, method: &str, params: Value) -> Value {
        let line = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let out = server.handle_line(&line.to_string()).expect("response");
        serde_json::from_str(&out).expect("json")
    }

    #[test]
    fn initialize_reports_server_info() {
        let temp = tempfile::tempdir().expect("tempdir");
        let server = server(temp.path(), Vec::new(), Vec::new());
        let resp = call(&server, 1, "initialize", json!({ "protocolVersion": "2025-03-26" }));
        assert_eq!(resp["result"]["serverInfo"]["name"], json!(SERVER_NAME));
        assert_eq!(resp["result"]["protocolVersion"], json!("2025-03-26"));
    }

    #[test]
    fn notifications_get_no_response() {
        let temp = tempfile::tempdir().expect("tempdir");
        let server = server(temp.path(), Vec::new(), Vec::new());
        let line = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        assert_eq!(server.handle_line(line), None);
        assert_eq!(server.handle_line("   "), None);
    }

    #[test]
    fn unknown_method_and_tool_are_method_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let server = server(temp.path(), Vec::new(), Vec::new());
        let resp = call(&server, 1, "resources/list", json!({}));
        assert_eq!(resp["error"]["code"], json!(METHOD_NOT_FOUND));
        let resp = call(&server, 2, "tools/call", json!({ "name": "deploy_wda" }));
        assert_eq!(resp["error"]["code"], json!(METHOD_NOT_FOUND));
    }

    #[test]
    fn listing_records_profiles_and_clears_selection() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_profile(
            &temp.path().join("profiles"),
            "A.mobileprovision",
            "1111",
            "XC iOS: com.acme.wda",
            "Acme",
        );
        let server = server(temp.path(), Vec::new(), Vec::new());

        let resp = call(&server, 1, "tools/call", json!({ "name": LIST_PROFILES }));
        let profiles = &resp["result"]["structuredContent"]["profiles"];
        assert_eq!(profiles[0]["uuid"], json!("1111"));
        assert_eq!(profiles[0]["bundleId"], json!("com.acme.wda"));

        call(
            &server,
            2,
            IS_FREE_ACCOUNT,
            json!({ "isFreeAccount": true, "profileUuid": "1111" }),
        );
        assert_eq!(server.session().phase, SessionPhase::AccountTypeConfirmed);
        assert!(server.session().selected_profile.is_some());

        call(&server, 3, LIST_PROFILES, json!({}));
        assert_eq!(server.session().phase, SessionPhase::ProfileListed);
        assert!(server.session().selected_profile.is_none());
    }

    #[test]
    fn empty_profile_dir_is_tool_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("profiles")).expect("mkdir");
        let server = server(temp.path(), Vec::new(), Vec::new());

        let resp = call(&server, 1, LIST_PROFILES, json!({}));
        assert_eq!(resp["result"]["isError"], json!(true));
        assert_eq!(
            resp["result"]["structuredContent"]["kind"],
            json!("empty_result_error")
        );
        assert_eq!(server.session().phase, SessionPhase::Idle);
    }

    #[test]
    fn build_without_account_type_is_validation_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let profile = write_profile(
            temp.path(),
            "A.mobileprovision",
            "1111",
            "XC iOS: com.a",
            "Acme",
        );
        let server = server(temp.path(), vec![ScriptedBuild::Bundle], Vec::new());

        let resp = call(
            &server,
            1,
            BUILD_AND_SIGN,
            json!({ "profilePath": profile, "projectPath": temp.path() }),
        );
        assert_eq!(resp["result"]["isError"], json!(true));
        assert!(
            resp["result"]["content"][0]["text"]
                .as_str()
                .expect("text")
                .contains("account type not confirmed")
        );
    }

    #[test]
    fn session_values_fill_in_build_arguments() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_profile(
            &temp.path().join("profiles"),
            "A.mobileprovision",
            "1111",
            "XC iOS: com.acme.wda",
            "Acme",
        );
        let server = server(
            temp.path(),
            vec![ScriptedBuild::Bundle],
            vec![ScriptedSign::Succeed {
                warnings: Vec::new(),
            }],
        );

        call(&server, 1, LIST_PROFILES, json!({}));
        call(
            &server,
            2,
            IS_FREE_ACCOUNT,
            json!({ "isFreeAccount": true, "profileUuid": "1111" }),
        );
        let resp = call(&server, 3, BUILD_AND_SIGN, json!({ "projectPath": temp.path() }));

        let result = &resp["result"]["structuredContent"];
        assert_eq!(resp["result"].get("isError"), None);
        assert_eq!(result["bundleId"], json!("com.acme.wda"));
        assert_eq!(result["profileUuid"], json!("1111"));
        assert_eq!(
            result["message"],
            json!("WebDriverAgent successfully built and signed")
        );
        assert_eq!(server.session().phase, SessionPhase::Completed);
        assert_eq!(server.session().project_path.as_deref(), Some(temp.path()));
    }

    fn wait_for_in_flight(server: &ToolServer) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while server.in_flight() == 0 {
            assert!(Instant::now() < deadline, "request never started");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn cancellation_reaches_every_request_with_the_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        let server = server(temp.path(), Vec::new(), Vec::new());
        let (_, first) = lock(&server.in_flight).register("7".to_string());
        let (_, second) = lock(&server.in_flight).register("7".to_string());
        let (_, other) = lock(&server.in_flight).register("8".to_string());

        let line = r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":7}}"#;
        assert_eq!(server.handle_line(line), None);
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
        assert!(!other.is_cancelled());
    }

    #[test]
    fn cancel_notification_stops_running_build() {
        let temp = tempfile::tempdir().expect("tempdir");
        let profile = write_profile(
            temp.path(),
            "A.mobileprovision",
            "1111",
            "XC iOS: com.a",
            "Acme",
        );
        let server = server(temp.path(), vec![ScriptedBuild::UntilCancelled], Vec::new());
        let args = json!({
            "profilePath": profile,
            "isFreeAccount": false,
            "projectPath": temp.path(),
        });

        let resp = thread::scope(|scope| {
            let running = scope.spawn(|| call(&server, 1, BUILD_AND_SIGN, args));
            wait_for_in_flight(&server);
            let cancel =
                r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":1}}"#;
            assert_eq!(server.handle_line(cancel), None);
            running.join().expect("build thread")
        });

        assert_eq!(resp["id"], json!(1));
        assert_eq!(resp["result"]["isError"], json!(true));
        assert_eq!(
            resp["result"]["structuredContent"]["kind"],
            json!("cancelled_error")
        );
        assert_eq!(server.session().phase, SessionPhase::Failed);
        assert_eq!(server.in_flight(), 0);
    }

    #[test]
    fn requests_after_cancel_all_start_cancelled() {
        let temp = tempfile::tempdir().expect("tempdir");
        let profile = write_profile(
            temp.path(),
            "A.mobileprovision",
            "1111",
            "XC iOS: com.a",
            "Acme",
        );
        let server = server(temp.path(), vec![ScriptedBuild::Bundle], Vec::new());
        server.cancel_all();

        let resp = call(
            &server,
            1,
            BUILD_AND_SIGN,
            json!({ "profilePath": profile, "isFreeAccount": false, "projectPath": temp.path() }),
        );
        assert_eq!(
            resp["result"]["structuredContent"]["kind"],
            json!("cancelled_error")
        );
        assert!(!temp.path().join("appium_wda_ios/wda-build.log").exists());

        let resp = call(&server, 2, "ping", json!({}));
        assert_eq!(resp["result"], json!({}));
    }

    #[test]
    fn concurrent_build_is_busy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let server = server(temp.path(), Vec::new(), Vec::new());
        let _held = lock(&server.pipeline);

        let resp = call(&server, 1, BUILD_AND_SIGN, json!({ "isFreeAccount": false }));
        assert_eq!(
            resp["result"]["structuredContent"]["kind"],
            json!("busy_error")
        );
    }
}
