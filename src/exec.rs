use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};

#[derive(PartialEq, Debug, Clone)]
pub enum Status {
    Exit(i32),
    Signal(i32),
    Timeout,
}

#[derive(PartialEq, Debug, Clone)]
pub struct Output {
    pub status: Status,
    pub stdout: String,
    pub stderr: String,
}

pub fn display_command(command: &[String]) -> String {
    command
        .iter()
        .map(|x| yash_quote::quote(x))
        .collect::<Vec<_>>()
        .join(" ")
}

pub async fn execute_command(
    command: &[String],
    stdin: &str,
    env: &[(String, String)],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<Output, String> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| "cannot execute empty command".to_string())?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd
        .spawn()
        .map_err(|err| format!("cannot execute {:?}: {}", command, err))?;

    let input = child.stdin.take();
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let mut stdout = vec![];
    let mut stderr = vec![];

    // stdin is fed while the output is drained so that neither pipe can stall the child
    let finished = tokio::time::timeout(timeout, async {
        let (written, out, err, status) = tokio::join!(
            write_stdin(input, stdin.as_bytes()),
            drain(stdout_pipe.as_mut(), &mut stdout),
            drain(stderr_pipe.as_mut(), &mut stderr),
            child.wait(),
        );
        written?;
        out.and(err)
            .map_err(|err| format!("cannot read output: {}", err))?;
        status.map_err(|err| format!("command execution failed: {}", err))
    })
    .await;

    let status = match finished {
        Ok(status) => status?,
        Err(_) => {
            if let Err(err) = child.kill().await {
                tracing::debug!("cannot kill timed out command: {}", err);
            }
            return Ok(Output {
                status: Status::Timeout,
                stdout: String::from_utf8_lossy(&stdout).to_string(),
                stderr: String::from_utf8_lossy(&stderr).to_string(),
            });
        }
    };

    let status = if let Some(code) = status.code() {
        Ok(Status::Exit(code))
    } else if let Some(signal) = status.signal() {
        Ok(Status::Signal(signal))
    } else {
        Err(format!("unknown process status: {}", status))
    }?;

    Ok(Output {
        status,
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
    })
}

async fn write_stdin(pipe: Option<ChildStdin>, input: &[u8]) -> Result<(), String> {
    if let Some(mut pipe) = pipe {
        match pipe.write_all(input).await {
            Err(err) if err.kind() != std::io::ErrorKind::BrokenPipe => {
                return Err(format!("cannot write stdin: {}", err))
            }
            _ => {}
        }
    }
    Ok(())
}

/// Appends everything read from `pipe` to `buf`; bytes read before a cancellation are kept.
async fn drain<R: AsyncRead + Unpin>(pipe: Option<&mut R>, buf: &mut Vec<u8>) -> std::io::Result<()> {
    let Some(pipe) = pipe else {
        return Ok(());
    };
    let mut chunk = [0u8; 8192];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod execute_command {
        use super::*;
        use pretty_assertions::assert_eq;
        use rstest::rstest;

        #[rstest]
        #[case("echo hello", "", vec![], Status::Exit(0), "hello\n", "")]
        #[case("echo hello >&2", "", vec![], Status::Exit(0), "", "hello\n")]
        #[case("cat", "hello", vec![], Status::Exit(0), "hello", "")]
        #[case("printf %s \"$MESSAGE\"", "", vec![("MESSAGE", "hi")], Status::Exit(0), "hi", "")]
        #[case("exit 3", "", vec![], Status::Exit(3), "", "")]
        #[case("kill -TERM $$", "", vec![], Status::Signal(15), "", "")]
        #[tokio::test]
        async fn success_cases(
            #[case] command: &str,
            #[case] stdin: &str,
            #[case] env: Vec<(&str, &str)>,
            #[case] status: Status,
            #[case] stdout: &str,
            #[case] stderr: &str,
        ) {
            let env = env
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Vec<_>>();
            let actual = execute_command(
                &["bash".to_string(), "-c".to_string(), command.to_string()],
                stdin,
                &env,
                None,
                Duration::from_secs(10),
            )
            .await;

            assert_eq!(
                Ok(Output {
                    status,
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                }),
                actual,
            );
        }

        #[tokio::test]
        async fn timed_out() {
            let actual = execute_command(
                &["sleep".to_string(), "5".to_string()],
                "",
                &[],
                None,
                Duration::from_millis(50),
            )
            .await;

            assert_eq!(Some(Status::Timeout), actual.ok().map(|o| o.status));
        }

        #[tokio::test]
        async fn timed_out_keeps_partial_output() {
            let actual = execute_command(
                &[
                    "bash".to_string(),
                    "-c".to_string(),
                    "echo partial; echo oops >&2; sleep 5".to_string(),
                ],
                "",
                &[],
                None,
                Duration::from_millis(500),
            )
            .await;

            assert_eq!(
                Ok(Output {
                    status: Status::Timeout,
                    stdout: "partial\n".to_string(),
                    stderr: "oops\n".to_string(),
                }),
                actual
            );
        }

        #[tokio::test]
        async fn timeout_covers_unread_stdin() {
            let stdin = "x".repeat(1024 * 1024);

            let started = std::time::Instant::now();
            let actual = execute_command(
                &["sleep".to_string(), "5".to_string()],
                &stdin,
                &[],
                None,
                Duration::from_millis(200),
            )
            .await;

            assert_eq!(Some(Status::Timeout), actual.ok().map(|o| o.status));
            assert!(started.elapsed() < Duration::from_secs(3));
        }

        #[tokio::test]
        async fn large_output_and_stdin_do_not_deadlock() {
            let stdin = "y\n".repeat(512 * 1024);

            let actual = execute_command(
                &["bash".to_string(), "-c".to_string(), "head -c 1048576 /dev/zero; wc -l".to_string()],
                &stdin,
                &[],
                None,
                Duration::from_secs(10),
            )
            .await
            .unwrap();

            assert_eq!(Status::Exit(0), actual.status);
            assert_eq!(1024 * 1024 + "524288\n".len(), actual.stdout.len());
        }

        #[tokio::test]
        async fn runs_in_given_directory() {
            let dir = tempfile::tempdir().unwrap();
            let actual = execute_command(
                &["pwd".to_string()],
                "",
                &[],
                Some(dir.path()),
                Duration::from_secs(10),
            )
            .await
            .unwrap();

            assert_eq!(
                std::fs::canonicalize(dir.path()).unwrap(),
                std::fs::canonicalize(actual.stdout.trim_end()).unwrap()
            );
        }

        #[tokio::test]
        async fn unknown_command() {
            let actual = execute_command(
                &["_unknown_command".to_string()],
                "",
                &[],
                None,
                Duration::from_secs(1),
            )
            .await;

            assert!(actual.is_err());
        }
    }

    #[test]
    fn display_command_quotes_arguments() {
        assert_eq!(
            "php -n 'a b.php'",
            display_command(&["php".to_string(), "-n".to_string(), "a b.php".to_string()])
        );
    }
}
