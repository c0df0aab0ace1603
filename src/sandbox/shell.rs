//! 命令执行器：白名单命令、jail 内工作目录、超时与输出截断
//!
//! 首个 token 必须在白名单（程序 -> 允许的子命令）中，否则在派生任何进程之前拒绝；
//! 不经 shell 解释，直接以 token 派生进程，含控制符或 `$` 的命令一律拒绝。
//! `cd` / `pwd` 为伪命令，在白名单之前拦截：只读写按身份跟踪的工作目录，`cd` 目标独立于 jail 重新校验。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::core::SandboxError;
use crate::sandbox::jail::ensure_within;
use crate::sandbox::SandboxContext;

tokio::task_local! {
    /// 当前请求所属身份，由 ChatOrchestrator 处理请求时设置；命令工作目录按身份隔离
    pub static CURRENT_IDENTITY: String;
}

/// 被视为 shell 控制符的片段（命令不经 shell，出现即拒绝）
const CONTROL_TOKENS: &[&str] = &[";", "|", "&", "`", "$", ">", "<", "\n"];

/// 白名单程序中能派生其它进程或写任意文件的参数
const DENIED_FLAGS: &[(&str, &[&str])] = &[
    (
        "find",
        &[
            "-exec", "-execdir", "-ok", "-okdir", "-delete", "-fprint", "-fprint0", "-fprintf", "-fls",
        ],
    ),
    ("git", &["--output", "--ext-diff", "--exec-path", "--open-files-in-pager", "-O"]),
];

/// 白名单中某程序允许的子命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedSubcommands {
    Any,
    Only(Vec<String>),
}

impl AllowedSubcommands {
    fn from_config(list: &[String]) -> Self {
        if list.is_empty() || list.iter().any(|s| s == "*") {
            AllowedSubcommands::Any
        } else {
            AllowedSubcommands::Only(list.to_vec())
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub duration_ms: u64,
    /// 执行时的工作目录（jail 内相对路径）
    pub cwd: String,
    pub simulated: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// 校验后的命令
#[derive(Debug, PartialEq, Eq)]
enum Parsed<'a> {
    ChangeDir(Option<&'a str>),
    PrintDir,
    Spawn(Vec<&'a str>),
}

pub struct CommandRunner {
    ctx: Arc<SandboxContext>,
    allowed: HashMap<String, AllowedSubcommands>,
    /// 身份 -> 工作目录；缺省为 jail 根
    cwds: Mutex<HashMap<String, PathBuf>>,
}

fn cwd_display(rel: &Path) -> String {
    if rel.as_os_str().is_empty() {
        "/".to_string()
    } else {
        format!("/{}", rel.to_string_lossy().replace('\\', "/"))
    }
}

fn identity_key() -> String {
    CURRENT_IDENTITY.try_with(|id| id.clone()).unwrap_or_default()
}

/// 最多读取 cap 字节，其余读出丢弃（避免子进程阻塞在写满的管道上）；返回 (数据, 是否截断)
async fn read_capped<R>(reader: Option<R>, cap: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok((Vec::new(), false));
    };
    let mut buf = Vec::new();
    (&mut reader).take(cap as u64 + 1).read_to_end(&mut buf).await?;
    let truncated = buf.len() > cap;
    if truncated {
        buf.truncate(cap);
        tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    }
    Ok((buf, truncated))
}

impl CommandRunner {
    pub(crate) fn new(ctx: Arc<SandboxContext>, allowed: &HashMap<String, Vec<String>>) -> Self {
        let allowed = allowed
            .iter()
            .map(|(program, subs)| (program.to_lowercase(), AllowedSubcommands::from_config(subs)))
            .collect();
        Self {
            ctx,
            allowed,
            cwds: Mutex::new(HashMap::new()),
        }
    }

    /// 当前身份的工作目录（jail 内相对路径）
    pub fn cwd(&self) -> PathBuf {
        let cwds = self.cwds.lock().unwrap_or_else(|e| e.into_inner());
        cwds.get(&identity_key()).cloned().unwrap_or_default()
    }

    fn set_cwd(&self, next: PathBuf) {
        let mut cwds = self.cwds.lock().unwrap_or_else(|e| e.into_inner());
        if next.as_os_str().is_empty() {
            cwds.remove(&identity_key());
        } else {
            cwds.insert(identity_key(), next);
        }
    }

    /// 控制符、伪命令、白名单、危险参数与参数路径校验
    fn check<'a>(&self, command: &'a str, cwd: &Path) -> Result<Parsed<'a>, SandboxError> {
        if let Some(op) = CONTROL_TOKENS.iter().find(|op| command.contains(*op)) {
            return Err(SandboxError::CommandNotAllowed(format!(
                "shell control operator '{}' is not permitted",
                op.escape_debug()
            )));
        }
        let tokens: Vec<&str> = command.split_whitespace().collect();
        let program = *tokens
            .first()
            .ok_or_else(|| SandboxError::CommandNotAllowed("empty command".to_string()))?;

        match program {
            "cd" if tokens.len() <= 2 => return Ok(Parsed::ChangeDir(tokens.get(1).copied())),
            "cd" => {
                return Err(SandboxError::CommandNotAllowed(
                    "cd takes a single directory".to_string(),
                ))
            }
            "pwd" => return Ok(Parsed::PrintDir),
            _ => {}
        }

        let program_key = program.to_lowercase();
        let rule = self
            .allowed
            .get(&program_key)
            .ok_or_else(|| SandboxError::CommandNotAllowed(program.to_string()))?;
        if let AllowedSubcommands::Only(subs) = rule {
            let sub = tokens.get(1).copied().unwrap_or("");
            if !subs.iter().any(|s| s == sub) {
                return Err(SandboxError::CommandNotAllowed(format!(
                    "{program} {sub} (allowed: {})",
                    subs.join(", ")
                )));
            }
        }

        let denied = DENIED_FLAGS
            .iter()
            .find(|(p, _)| *p == program_key)
            .map(|(_, flags)| *flags)
            .unwrap_or(&[]);
        for &arg in tokens.iter().skip(1) {
            let flag = arg.split_once('=').map(|(f, _)| f).unwrap_or(arg);
            if denied.contains(&flag) {
                return Err(SandboxError::CommandNotAllowed(format!(
                    "{program} {flag} is not permitted"
                )));
            }
        }

        // 参数中的路径同样受 jail 与屏蔽列表约束
        for &arg in tokens.iter().skip(1) {
            let value = match arg.strip_prefix('-') {
                Some(flag) => match flag.split_once('=') {
                    Some((_, v)) => v,
                    None => continue,
                },
                None => arg,
            };
            if value.is_empty() {
                continue;
            }
            let rel = self.ctx.jail.normalize(cwd, value)?;
            self.ctx.jail.check_blocked(&rel)?;
        }
        Ok(Parsed::Spawn(tokens))
    }

    /// 执行命令；timeout_secs 被限制在 [1, max_command_timeout_secs]
    pub async fn run(
        &self,
        command: &str,
        timeout_secs: Option<u64>,
    ) -> Result<CommandOutput, SandboxError> {
        let command = command.trim();
        let cwd = self.cwd();
        let parsed = match self.check(command, &cwd) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(command = %command, error = %e, "command rejected");
                return Err(e);
            }
        };

        let tokens = match parsed {
            Parsed::ChangeDir(target) => {
                return self.change_dir(command, target).map_err(|e| {
                    tracing::warn!(command = %command, error = %e, "cd rejected");
                    e
                })
            }
            Parsed::PrintDir => {
                return Ok(CommandOutput {
                    command: command.to_string(),
                    exit_code: Some(0),
                    stdout: cwd_display(&cwd),
                    stderr: String::new(),
                    truncated: false,
                    duration_ms: 0,
                    cwd: cwd_display(&cwd),
                    simulated: self.ctx.is_simulating(),
                })
            }
            Parsed::Spawn(tokens) => tokens,
        };

        let limits = &self.ctx.limits;
        let secs = timeout_secs
            .unwrap_or(limits.command_timeout_secs)
            .clamp(1, limits.max_command_timeout_secs.max(1));
        let simulated = self.ctx.is_simulating();
        let root = self.ctx.write_root();
        let workdir = root.join(&cwd);
        if simulated {
            std::fs::create_dir_all(&workdir)?;
        }
        ensure_within(&root, &workdir)?;
        if !workdir.is_dir() {
            return Err(SandboxError::NotFound(cwd_display(&cwd)));
        }

        tracing::info!(command = %command, cwd = %cwd_display(&cwd), timeout_secs = secs, simulated, "run command");
        let start = Instant::now();
        let mut child = Command::new(tokens[0])
            .args(&tokens[1..])
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let cap = limits.max_output_bytes;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let collect = async {
            let (out, err, status) = tokio::join!(
                read_capped(stdout, cap),
                read_capped(stderr, cap),
                child.wait()
            );
            Ok::<_, std::io::Error>((out?, err?, status?))
        };
        let ((stdout, out_trunc), (stderr, err_trunc), status) =
            match tokio::time::timeout(Duration::from_secs(secs), collect).await {
                Ok(result) => result?,
                Err(_) => {
                    tracing::warn!(command = %command, timeout_secs = secs, "command timed out");
                    return Err(SandboxError::CommandTimeout(secs));
                }
            };

        Ok(CommandOutput {
            command: command.to_string(),
            exit_code: status.code(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            truncated: out_trunc || err_trunc,
            duration_ms: start.elapsed().as_millis() as u64,
            cwd: cwd_display(&cwd),
            simulated,
        })
    }

    /// `cd` 伪命令：目标须在 jail 内且为已存在目录；无参数或 `~` 时回到根
    fn change_dir(&self, command: &str, target: Option<&str>) -> Result<CommandOutput, SandboxError> {
        let current = self.cwd();
        let next = match target {
            None | Some("~") => PathBuf::new(),
            Some(t) => self.ctx.jail.normalize(&current, t)?,
        };
        self.ctx.jail.check_blocked(&next)?;
        let (root, full) = self.ctx.read_location(&next);
        ensure_within(&root, &full)?;
        if !full.is_dir() {
            return Err(SandboxError::NotFound(cwd_display(&next)));
        }

        self.set_cwd(next.clone());
        tracing::info!(cwd = %cwd_display(&next), "working directory changed");
        Ok(CommandOutput {
            command: command.to_string(),
            exit_code: Some(0),
            stdout: cwd_display(&next),
            stderr: String::new(),
            truncated: false,
            duration_ms: 0,
            cwd: cwd_display(&next),
            simulated: self.ctx.is_simulating(),
        })
    }
}
