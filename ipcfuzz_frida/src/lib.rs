/*!
Frida-backed [`CoverageAgent`]: attaches to the target process by name,
injects the embedded QJS agent, and drives its four-method RPC surface
over frida's script messaging.
*/

use std::{
    sync::mpsc::{channel, Receiver, Sender},
    time::{Duration, Instant},
};

use frida::{DeviceManager, Frida, Message, ScriptHandler, ScriptOption, ScriptRuntime};
use log::{debug, warn};
use serde_json::{json, Value};

use ipcfuzz::{
    bolts::os::find_process,
    observers::{trace_failed, CoverageAgent, CoverageBlock, HandlerSpec},
    Error, TraceStage,
};

/// The instrumentation script injected into the target.
const AGENT_SOURCE: &str = include_str!("agent.js");

/// Every agent RPC answers within this window or the call failed.
const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwards `send` payloads from the script into a channel the RPC
/// caller drains. Console output and agent errors are only logged.
struct MessagePump {
    tx: Sender<Value>,
}

impl ScriptHandler for MessagePump {
    fn on_message(&mut self, message: &Message) {
        match message {
            Message::Send(send) => {
                let _ = self.tx.send(send.payload.clone());
            }
            Message::Error(err) => warn!("agent error: {err:?}"),
            other => debug!("agent message: {other:?}"),
        }
    }
}

/// A frida session against one target process.
///
/// `start` is re-entrant: while the script is loaded, repeated calls
/// reuse the session instead of re-injecting.
///
/// The frida runtime, device manager and device are leaked to the
/// `'static` lifetime: one agent serves the whole fuzzing run, and the
/// gum objects must outlive every session and script spawned from them.
pub struct FridaCoverageAgent {
    device: &'static mut frida::Device<'static>,
    session: Option<&'static frida::Session<'static>>,
    script: Option<frida::Script<'static>>,
    rx: Option<Receiver<Value>>,
    next_request_id: u64,
}

impl FridaCoverageAgent {
    /// Obtains the frida runtime; fails when no local device is usable.
    pub fn new() -> Result<Self, Error> {
        let frida: &'static Frida = Box::leak(Box::new(unsafe { Frida::obtain() }));
        let manager: &'static DeviceManager =
            Box::leak(Box::new(DeviceManager::obtain(frida)));
        let device = manager
            .get_local_device()
            .map_err(|err| trace_failed(TraceStage::Attach, format!("{err}")))?;
        Ok(Self {
            device: Box::leak(Box::new(device)),
            session: None,
            script: None,
            rx: None,
            next_request_id: 0,
        })
    }

    fn attach_and_load(&mut self, process_name: &str) -> Result<(), Error> {
        let pid = find_process(process_name)
            .ok_or_else(|| {
                trace_failed(
                    TraceStage::Attach,
                    format!("no process named {process_name}"),
                )
            })?
            .pid;

        let session = self
            .device
            .attach(pid)
            .map_err(|err| trace_failed(TraceStage::Attach, format!("{err}")))?;
        // The script borrows the session; both live as long as the agent.
        let session: &'static frida::Session<'static> = Box::leak(Box::new(session));

        let mut options = ScriptOption::new()
            .set_name("ipcfuzz-agent")
            .set_runtime(ScriptRuntime::QJS);
        let mut script = session
            .create_script(AGENT_SOURCE, &mut options)
            .map_err(|err| trace_failed(TraceStage::Attach, format!("{err}")))?;

        let (tx, rx) = channel();
        script
            .handle_message(MessagePump { tx })
            .map_err(|err| trace_failed(TraceStage::Attach, format!("{err}")))?;
        script
            .load()
            .map_err(|err| trace_failed(TraceStage::Attach, format!("{err}")))?;

        debug!("agent injected into {process_name} (pid {pid})");
        self.session = Some(session);
        self.script = Some(script);
        self.rx = Some(rx);
        Ok(())
    }

    /// One round-trip over the `frida:rpc` envelope.
    fn rpc_call(&mut self, stage: TraceStage, method: &str, args: Value) -> Result<Value, Error> {
        let script = self
            .script
            .as_mut()
            .ok_or_else(|| trace_failed(stage, "agent is not loaded"))?;
        let rx = self
            .rx
            .as_ref()
            .ok_or_else(|| trace_failed(stage, "agent channel is gone"))?;

        let id = self.next_request_id;
        self.next_request_id += 1;
        let envelope = json!(["frida:rpc", id, "call", method, args]);
        script
            .post(&envelope.to_string(), None)
            .map_err(|err| trace_failed(stage, format!("{err}")))?;

        let deadline = Instant::now() + RPC_TIMEOUT;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| trace_failed(stage, format!("{method} timed out")))?;
            let payload = rx
                .recv_timeout(remaining)
                .map_err(|_| trace_failed(stage, format!("{method} timed out")))?;

            // Replies are the rpc envelope itself; unrelated `send`
            // payloads from the agent are skipped.
            let Some(parts) = payload.as_array() else {
                continue;
            };
            if parts.first().and_then(Value::as_str) != Some("frida:rpc")
                || parts.get(1).and_then(Value::as_u64) != Some(id)
            {
                continue;
            }
            return match parts.get(2).and_then(Value::as_str) {
                Some("ok") => Ok(parts.get(3).cloned().unwrap_or(Value::Null)),
                Some("error") => Err(trace_failed(
                    stage,
                    parts
                        .get(3)
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "agent error".to_string()),
                )),
                _ => Err(trace_failed(stage, "malformed agent reply")),
            };
        }
    }
}

/// Parses `[{module, coverage: [[startHex, endHex], ...]}]` (at most one
/// element) into coverage blocks.
fn parse_coverage(value: &Value) -> Result<Vec<CoverageBlock>, Error> {
    let Some(modules) = value.as_array() else {
        return Err(trace_failed(TraceStage::GetCoverage, "not an array"));
    };
    let Some(entry) = modules.first() else {
        return Ok(Vec::new());
    };

    let module = entry
        .get("module")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let pairs = entry
        .get("coverage")
        .and_then(Value::as_array)
        .ok_or_else(|| trace_failed(TraceStage::GetCoverage, "missing coverage list"))?;

    let mut blocks = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let (Some(start), Some(end)) = (
            pair.get(0).and_then(Value::as_str),
            pair.get(1).and_then(Value::as_str),
        ) else {
            continue;
        };
        let (Ok(block_start), Ok(block_end)) = (parse_address(start), parse_address(end)) else {
            warn!("unparsable coverage pair {start}..{end}");
            continue;
        };
        blocks.push(CoverageBlock {
            module: module.clone(),
            block_start,
            block_end,
        });
    }
    Ok(blocks)
}

fn parse_address(text: &str) -> Result<u64, std::num::ParseIntError> {
    let text = text.trim_start_matches("0x");
    u64::from_str_radix(text, 16)
}

impl CoverageAgent for FridaCoverageAgent {
    fn start(&mut self, process_name: &str, handler: &HandlerSpec) -> Result<(), Error> {
        if self.script.is_none() {
            self.attach_and_load(process_name)?;
        }
        let reply = self.rpc_call(
            TraceStage::SetTarget,
            "setTarget",
            json!([{ "module": handler.module, "handler": handler.handler }]),
        )?;
        if reply.as_str() != Some("true") {
            return Err(trace_failed(
                TraceStage::SetTarget,
                format!("unexpected reply {reply}"),
            ));
        }
        self.rpc_call(TraceStage::StartFeed, "startCoverageFeed", json!([]))?;
        Ok(())
    }

    fn get_coverage(&mut self) -> Result<Vec<CoverageBlock>, Error> {
        let value = self.rpc_call(TraceStage::GetCoverage, "getCoverage", json!([]))?;
        parse_coverage(&value)
    }

    fn get_last_exec_time(&mut self) -> Result<u64, Error> {
        let value = self.rpc_call(TraceStage::GetExecTime, "getExecTime", json!([]))?;
        value
            .as_u64()
            .ok_or_else(|| trace_failed(TraceStage::GetExecTime, format!("bad reply {value}")))
    }

    fn clear_coverage(&mut self) -> Result<(), Error> {
        self.rpc_call(TraceStage::Clear, "clearCoverage", json!([]))?;
        Ok(())
    }

    fn unload(&mut self) -> Result<(), Error> {
        if let Some(mut script) = self.script.take() {
            script
                .unload()
                .map_err(|err| trace_failed(TraceStage::Unload, format!("{err}")))?;
        }
        self.rx = None;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Error> {
        if self.script.is_some() {
            self.unload()?;
        }
        if let Some(session) = self.session.take() {
            session
                .detach()
                .map_err(|err| trace_failed(TraceStage::Unload, format!("{err}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coverage_json_parses_into_blocks() {
        let value = serde_json::json!([{
            "module": "svc.exe",
            "coverage": [["0x7ff600001000", "0x7ff600001020"], ["0x7ff600002000", "0x7ff600002044"]],
        }]);
        let blocks = parse_coverage(&value).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].module, "svc.exe");
        assert_eq!(blocks[0].block_start, 0x7ff6_0000_1000);
        assert_eq!(blocks[1].block_end, 0x7ff6_0000_2044);
    }

    #[test]
    fn empty_coverage_is_no_blocks() {
        assert!(parse_coverage(&serde_json::json!([])).unwrap().is_empty());
    }

    #[test]
    fn malformed_pairs_are_skipped() {
        let value = serde_json::json!([{
            "module": "svc.exe",
            "coverage": [["zzz", "0x10"], ["0x20", "0x24"]],
        }]);
        let blocks = parse_coverage(&value).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].block_start, 0x20);
    }
}
