use crate::process::{Process, ProcessOpts, Stdio};
use bytes::Bytes;
use monad::{cont, Cont, Error, Result};
use reactor::Reactor;
use std::os::fd::RawFd;
use std::rc::Rc;
use stream::{BufferedStream, File, Stream};

/// Run a command with all three streams piped; resolves with
/// (stdout, stderr, exit status).
pub fn process_call(
    mut opts: ProcessOpts,
    input: Option<Bytes>,
    core: &Reactor,
) -> Cont<(Bytes, Bytes, i32)> {
    opts.stdin = Stdio::Pipe;
    opts.stdout = Stdio::Pipe;
    opts.stderr = Stdio::Pipe;
    let core = core.clone();
    cont(async move {
        let proc = Process::spawn(opts, &core)?;
        let result = drive_call(&proc, input).await;
        proc.dispose();
        result
    })
}

async fn drive_call(proc: &Process, input: Option<Bytes>) -> Result<(Bytes, Bytes, i32)> {
    let stdin = proc.stdin().expect("stdin is piped");
    match input {
        Some(input) => {
            stdin.write_schedule(input);
            stdin.flush_and_dispose().await?;
        }
        None => stdin.dispose(),
    }

    let out = proc.stdout().expect("stdout is piped").read_until_eof().promise();
    let err = proc.stderr().expect("stderr is piped").read_until_eof().promise();
    let out = out.cont().await?;
    let err = err.cont().await?;
    let code = proc.status().cont().await?;
    Ok((out, err, code))
}

/// Run a pipeline c1 | c2 | ... | cn.
///
/// Adjacent stages are wired stdout-to-stdin through raw descriptors
/// (no buffering in between); stderr of every stage drains into one
/// shared pipe. Resolves with (last stdout, combined stderr, exit
/// statuses in stage order). Under `check`, the first non-zero status
/// resolves the call with a process error.
pub fn process_chain_call(
    commands: Vec<Vec<String>>,
    input: Option<Bytes>,
    check: bool,
    core: &Reactor,
) -> Cont<(Bytes, Bytes, Vec<i32>)> {
    let core = core.clone();
    cont(async move {
        if commands.is_empty() {
            return Err(Error::value("empty command pipeline"));
        }

        let count = commands.len();
        let mut close_after_spawn: Vec<RawFd> = Vec::new();

        // Shared stderr pipe: every stage writes, the parent reads.
        let (err_read, err_write) = raw_pipe()?;
        close_after_spawn.push(err_write);
        let err_stream = BufferedStream::new(Rc::new(File::new(err_read, true, &core)?), None);

        let mut stages: Vec<Process> = Vec::with_capacity(count);
        let mut next_stdin = Stdio::Pipe;
        let spawned: Result<()> = (|| {
            for (index, command) in commands.iter().enumerate() {
                let mut opts = ProcessOpts::new(command.clone());
                opts.check = false;
                opts.stdin = next_stdin;
                opts.stderr = Stdio::Fd(err_write);
                if index + 1 == count {
                    opts.stdout = Stdio::Pipe;
                } else {
                    let (read_end, write_end) = raw_pipe()?;
                    close_after_spawn.push(read_end);
                    close_after_spawn.push(write_end);
                    opts.stdout = Stdio::Fd(write_end);
                    next_stdin = Stdio::Fd(read_end);
                }
                stages.push(Process::spawn(opts, &core)?);
            }
            Ok(())
        })();

        // The parent's copies of the wiring descriptors must go away
        // regardless, or downstream stages never see EOF.
        for fd in close_after_spawn {
            // Safety: closing parent copies of descriptors the
            // children inherited.
            unsafe { libc::close(fd) };
        }
        if let Err(error) = spawned {
            for stage in &stages {
                stage.dispose();
            }
            err_stream.dispose();
            return Err(error);
        }

        let first = stages.first().expect("pipeline is non-empty");
        let stdin = first.stdin().expect("first stage stdin is piped");
        match input {
            Some(input) => {
                stdin.write_schedule(input);
                stdin.flush_and_dispose().await?;
            }
            None => stdin.dispose(),
        }

        let last = stages.last().expect("pipeline is non-empty");
        let out = last.stdout().expect("last stage stdout is piped").read_until_eof().promise();
        let err = err_stream.read_until_eof().promise();

        let out = out.cont().await?;
        let err = err.cont().await?;

        let mut codes = Vec::with_capacity(count);
        for stage in &stages {
            codes.push(stage.status().cont().await?);
        }
        for stage in &stages {
            stage.dispose();
        }
        err_stream.dispose();

        if check {
            if let Some(code) = codes.iter().find(|code| **code != 0) {
                return Err(Error::process(format!(
                    "pipeline stage exited with status {code}"
                )));
            }
        }
        Ok((out, err, codes))
    })
}

fn raw_pipe() -> Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    // Safety: fds points at a live two-element array.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(Error::connection(format!(
            "pipe: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok((fds[0], fds[1]))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    static REAP: Mutex<()> = Mutex::new(());

    fn with_core<T>(run: impl FnOnce(&Reactor) -> T) -> T {
        let _guard = REAP.lock().unwrap_or_else(|poison| poison.into_inner());
        let core = Reactor::new().unwrap();
        let out = run(&core);
        core.dispose();
        out
    }

    #[test]
    fn test_process_call_collects_all_three() {
        with_core(|core| {
            let call = process_call(
                ProcessOpts::new(["cat"]),
                Some(Bytes::from_static(b"0123456789")),
                core,
            )
            .promise();
            let (out, err, code) = core.run_until(&call).unwrap();
            assert_eq!(out, Bytes::from_static(b"0123456789"));
            assert_eq!(err, Bytes::new());
            assert_eq!(code, 0);
        });
    }

    #[test]
    fn test_process_call_checks_exit() {
        with_core(|core| {
            let call = process_call(ProcessOpts::new(["false"]), None, core).promise();
            let error = core.run_until(&call).unwrap_err();
            assert_eq!(error.kind(), monad::ErrorKind::Process);
        });
    }

    #[test]
    fn test_pipeline_wires_stage_stdio() {
        with_core(|core| {
            let commands = vec![
                vec!["echo".to_string(), "10".to_string()],
                vec!["cat".to_string()],
                vec!["wc".to_string(), "-c".to_string()],
            ];
            let call = process_chain_call(commands, None, false, core).promise();
            let (out, err, codes) = core.run_until(&call).unwrap();
            assert_eq!(out, Bytes::from_static(b"3\n"));
            assert_eq!(err, Bytes::new());
            assert_eq!(codes, vec![0, 0, 0]);
        });
    }

    #[test]
    fn test_pipeline_feeds_stdin_and_checks() {
        with_core(|core| {
            let commands = vec![vec!["cat".to_string()], vec!["wc".to_string(), "-c".to_string()]];
            let call =
                process_chain_call(commands, Some(Bytes::from_static(b"10")), false, core)
                    .promise();
            let (out, _err, codes) = core.run_until(&call).unwrap();
            assert_eq!(out, Bytes::from_static(b"2\n"));
            assert_eq!(codes, vec![0, 0]);

            let failing = vec![vec!["false".to_string()], vec!["cat".to_string()]];
            let call = process_chain_call(failing, None, true, core).promise();
            let error = core.run_until(&call).unwrap_err();
            assert_eq!(error.kind(), monad::ErrorKind::Process);
        });
    }
}
