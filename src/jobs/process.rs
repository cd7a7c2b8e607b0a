//! 外部进程：构建命令、逐行读取输出、发送终止信号、shell 转义
//!
//! Child 只由执行任务持有；其他任务通过 ProcessSignal 请求终止，由持有者实际发送信号。
//! Unix 上子进程自成进程组，信号发给整个组，后台派生的进程也会一并终止；
//! 进程组内还有成员时组号不会被复用，组长回收之后仍可安全发送。

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// 提示子进程不要缓冲输出（Python 脚本尤其需要）
pub const UNBUFFERED_ENV: (&str, &str) = ("PYTHONUNBUFFERED", "1");

/// 单行最大字节数，超出部分拆成新行
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// 终止请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// 优雅终止（Unix 上为 SIGTERM）
    Terminate,
    /// 强制终止（SIGKILL）
    Kill,
}

impl ProcessSignal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Terminate => "SIGTERM",
            Self::Kill => "SIGKILL",
        }
    }
}

/// 由 argv 构建命令：宿主环境 + 动作覆盖变量 + 无缓冲提示，stdin 关闭，独立进程组
pub fn build_command(argv: &[String], env: &BTreeMap<String, String>) -> io::Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "命令为空"))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(env)
        .env(UNBUFFERED_ENV.0, UNBUFFERED_ENV.1)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    Ok(command)
}

/// 发送信号：给出进程组号时发给整个组，否则只发给子进程本身
///
/// 组内已无进程时返回 ESRCH，子进程已回收时返回 NotFound，均可用 is_process_gone 判断。
pub fn send_signal(child: &mut Child, group: Option<u32>, signal: ProcessSignal) -> io::Result<()> {
    #[cfg(unix)]
    {
        if let Some(pgid) = group {
            return signal_group(pgid, signal);
        }
    }
    #[cfg(not(unix))]
    let _ = group;

    match signal {
        ProcessSignal::Kill => child.start_kill(),
        ProcessSignal::Terminate => terminate(child),
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: ProcessSignal) -> io::Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        ProcessSignal::Terminate => Signal::SIGTERM,
        ProcessSignal::Kill => Signal::SIGKILL,
    };
    killpg(Pid::from_raw(pgid as i32), sig).map_err(io::Error::from)
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = child
        .id()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "process already reaped"))?;
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

/// 信号导致的退出返回 -signo，与常见脚本运行时的约定一致
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signo) = status.signal() {
            return -signo;
        }
    }
    -1
}

/// 是否是「进程已经不存在」类错误（终止与自然退出的竞态）
pub fn is_process_gone(err: &io::Error) -> bool {
    if matches!(err.kind(), io::ErrorKind::NotFound | io::ErrorKind::InvalidInput) {
        return true;
    }
    #[cfg(unix)]
    {
        if err.raw_os_error() == Some(nix::errno::Errno::ESRCH as i32) {
            return true;
        }
    }
    false
}

/// 逐行读取输出：非法 UTF-8 以替换字符保留，去掉行尾空白；超过 max_line 字节的行被拆开
pub async fn pump_lines<R, F, Fut>(reader: R, max_line: usize, mut on_line: F) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(String) -> Fut,
    Fut: Future,
{
    let max_line = max_line.max(1);
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    // 上一行因超长被拆开时，紧随其后的换行不再产生空行
    let mut split = false;
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            if !buf.is_empty() {
                on_line(decode_line(&buf)).await;
            }
            return Ok(());
        }

        let room = max_line - buf.len();
        let window = &chunk[..chunk.len().min(room)];
        let (consumed, newline) = match window.iter().position(|&b| b == b'\n') {
            Some(i) => {
                buf.extend_from_slice(&window[..i]);
                (i + 1, true)
            }
            None => {
                buf.extend_from_slice(window);
                (window.len(), false)
            }
        };
        reader.consume(consumed);

        if newline && buf.is_empty() && split {
            split = false;
        } else if newline || buf.len() >= max_line {
            split = !newline;
            on_line(decode_line(&buf)).await;
            buf.clear();
        }
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_string()
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c)
}

/// 单个 token 的 POSIX shell 转义
pub fn shell_quote(token: &str) -> Cow<'_, str> {
    if token.is_empty() {
        return Cow::Borrowed("''");
    }
    if token.chars().all(is_shell_safe) {
        return Cow::Borrowed(token);
    }
    Cow::Owned(format!("'{}'", token.replace('\'', "'\"'\"'")))
}

/// 转义后以空格拼接，用于展示与审计
pub fn shell_join<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("--execute"), "--execute");
        assert_eq!(shell_quote("a/b.py"), "a/b.py");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("前端"), "'前端'");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
    }

    #[test]
    fn test_shell_join() {
        let parts = ["python3", "sync", "--owner", "前端"];
        assert_eq!(shell_join(&parts), "python3 sync --owner '前端'");
    }

    #[test]
    fn test_build_command_rejects_empty_argv() {
        let err = build_command(&[], &BTreeMap::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_pump_lines_replaces_invalid_utf8() {
        let input: &[u8] = b"ok line  \r\nbad \xff\xfe byte\nlast";
        let mut lines = Vec::new();
        pump_lines(input, MAX_LINE_BYTES, |line| {
            lines.push(line);
            async {}
        })
        .await
        .unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "ok line");
        assert!(lines[1].contains('\u{FFFD}'));
        assert!(lines[1].starts_with("bad "));
        assert_eq!(lines[2], "last");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_from_signal() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 5"])
            .spawn()
            .unwrap();
        send_signal(&mut child, None, ProcessSignal::Kill).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(exit_code(status), -9);
    }

    #[tokio::test]
    async fn test_pump_lines_splits_overlong_lines() {
        let mut input = vec![b'x'; 10];
        input.extend_from_slice(b"\nshort\nzzzz\n\n");
        input.extend_from_slice(&[b'y'; 7]);
        let mut lines = Vec::new();
        pump_lines(input.as_slice(), 4, |line| {
            lines.push(line);
            async {}
        })
        .await
        .unwrap();
        assert_eq!(lines, vec!["xxxx", "xxxx", "xx", "shor", "t", "zzzz", "", "yyyy", "yyy"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_group_signal_reaches_background_children() {
        let mut child = build_command(
            &["sh".into(), "-c".into(), "sleep 30 & echo $!".into()],
            &BTreeMap::new(),
        )
        .unwrap()
        .spawn()
        .unwrap();
        let pgid = child.id();
        let stdout = child.stdout.take().unwrap();
        assert_eq!(child.wait().await.unwrap().code(), Some(0));

        // 组长已退出，后台 sleep 仍持有 stdout
        send_signal(&mut child, pgid, ProcessSignal::Terminate).unwrap();
        let mut lines = Vec::new();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            pump_lines(stdout, MAX_LINE_BYTES, |line| {
                lines.push(line);
                async {}
            }),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(lines.len(), 1);
    }
}
