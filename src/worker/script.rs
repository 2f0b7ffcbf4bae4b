//! Line-oriented script runner.
//!
//! Interprets the request payload as a small command script, one command
//! per line. This is the reference runner used by the bundled worker
//! binary and by the integration tests; real deployments supply their own
//! [`TaskRunner`](super::TaskRunner).
//!
//! ```text
//! rows N            emit a result set of N rows (columns: n int64)
//! tag TEXT          report TEXT as a completion tag
//! sleep MS          sleep, checking for cancellation every slice
//! notice TEXT       emit a notice diagnostic
//! notify TEXT       emit an out-of-band notification
//! progress PCT MSG  publish a progress report
//! error TEXT        fail the task with TEXT
//! ```

use std::time::Duration;

use crate::protocol::{ColumnDesc, ColumnType, Severity, Value, WireError};
use crate::shm::ShmError;

use super::{FrameSink, TaskRunner};

/// Sleep slice between cancel checks.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Runner interpreting the request as a command script.
#[derive(Debug, Default)]
pub struct ScriptRunner;

impl TaskRunner for ScriptRunner {
    fn run(&mut self, request: &[u8], sink: &mut FrameSink) -> Result<(), WireError> {
        let script = String::from_utf8_lossy(request);
        for line in script.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            sink.check_interrupt()?;
            let (cmd, arg) = line.split_once(' ').unwrap_or((line, ""));
            match cmd {
                "rows" => self.rows(arg, sink)?,
                "tag" => sink.command_done(arg).map_err(transport)?,
                "sleep" => self.sleep(arg, sink)?,
                "notice" => sink
                    .notice(WireError::new(Severity::Notice, "00000", arg))
                    .map_err(transport)?,
                "notify" => sink.async_event(arg.as_bytes()).map_err(transport)?,
                "progress" => {
                    let (pct, msg) = arg.split_once(' ').unwrap_or((arg, ""));
                    let pct = pct.parse::<u8>().map_err(|_| bad_script(line))?;
                    sink.report_progress(pct, msg);
                }
                "error" => return Err(WireError::new(Severity::Error, "P0001", arg)),
                _ => return Err(bad_script(line)),
            }
        }
        Ok(())
    }
}

impl ScriptRunner {
    fn rows(&self, arg: &str, sink: &mut FrameSink) -> Result<(), WireError> {
        let n: i64 = arg.parse().map_err(|_| bad_script(arg))?;
        sink.schema(&[ColumnDesc {
            name: "n".into(),
            type_code: ColumnType::Int64.code(),
        }])
        .map_err(transport)?;
        for i in 1..=n {
            sink.check_interrupt()?;
            sink.row(&[Value::Int64(i)]).map_err(transport)?;
        }
        Ok(())
    }

    fn sleep(&self, arg: &str, sink: &mut FrameSink) -> Result<(), WireError> {
        let ms: u64 = arg.parse().map_err(|_| bad_script(arg))?;
        let mut left = Duration::from_millis(ms);
        while !left.is_zero() {
            sink.check_interrupt()?;
            let slice = left.min(SLEEP_SLICE);
            std::thread::sleep(slice);
            left -= slice;
        }
        Ok(())
    }
}

fn bad_script(line: &str) -> WireError {
    WireError::new(
        Severity::Error,
        "42601",
        format!("invalid script command: {line:?}"),
    )
}

fn transport(e: ShmError) -> WireError {
    WireError::new(Severity::Error, "58000", e.to_string())
}
