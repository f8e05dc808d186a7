use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub enum CommandOutcome {
    Finished {
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
    /// Pipes are abandoned: grandchildren may still hold them open.
    TimedOut { after: Duration },
}

fn drain<R: Read + Send + 'static>(source: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut source) = source {
            let _ = source.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn collect(handle: JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

/// Runs `cmd` to completion or until `timeout`, killing it in the latter
/// case. Output pipes are drained on their own threads so a chatty child
/// cannot block on a full pipe.
pub fn run_with_timeout(cmd: &mut Command, timeout: Option<Duration>) -> Result<CommandOutcome> {
    cmd.stdout(Stdio::piped());
    run(cmd, timeout)
}

/// Like [`run_with_timeout`] with stdout going straight to `sink`.
pub fn run_into(cmd: &mut Command, sink: File, timeout: Option<Duration>) -> Result<CommandOutcome> {
    cmd.stdout(Stdio::from(sink));
    run(cmd, timeout)
}

fn run(cmd: &mut Command, timeout: Option<Duration>) -> Result<CommandOutcome> {
    cmd.stdin(Stdio::null());
    cmd.stderr(Stdio::piped());
    let mut child: Child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {:?}", cmd.get_program()))?;
    let out = drain(child.stdout.take());
    let err = drain(child.stderr.take());

    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(CommandOutcome::Finished {
                status,
                stdout: collect(out),
                stderr: collect(err),
            });
        }
        if let Some(limit) = timeout
            && started.elapsed() >= limit
        {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(CommandOutcome::TimedOut { after: limit });
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Last `max_chars` characters of `text`, control characters stripped.
pub fn tail(text: &str, max_chars: usize) -> String {
    let clean: String = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let clean = clean.trim();
    let count = clean.chars().count();
    if count <= max_chars {
        return clean.to_string();
    }
    let mut s = String::from("…");
    s.extend(clean.chars().skip(count - max_chars));
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_command_reports_output() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2; exit 3");
        match run_with_timeout(&mut cmd, Some(Duration::from_secs(10))).expect("run") {
            CommandOutcome::Finished {
                status,
                stdout,
                stderr,
            } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stdout.trim(), "out");
                assert_eq!(stderr.trim(), "err");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn slow_command_is_killed() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 5");
        let started = Instant::now();
        let outcome = run_with_timeout(&mut cmd, Some(Duration::from_millis(200))).expect("run");
        assert!(matches!(outcome, CommandOutcome::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn large_output_does_not_block() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("i=0; while [ $i -lt 20000 ]; do echo line-$i >&2; i=$((i+1)); done");
        let outcome = run_with_timeout(&mut cmd, Some(Duration::from_secs(30))).expect("run");
        match outcome {
            CommandOutcome::Finished { status, stderr, .. } => {
                assert!(status.success());
                assert!(stderr.contains("line-19999"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail("abc\ndef", 3), "…def");
        assert_eq!(tail("short", 10), "short");
    }
}
