//! 沙箱执行器：所有文件与命令操作都被限制在 jail 根之内
//!
//! - **jail**: 路径规范化、屏蔽列表、符号链接校验
//! - **fs**: read / write / list / delete
//! - **shell**: 白名单命令与 `cd` 工作目录跟踪
//!
//! simulate 模式下写入与删除落到影子树，真实 jail 不被改动；
//! 对仅存在于真实 jail 的文件的删除记为墓碑，之后的模拟读取与列目录视其为已删除。

pub mod fs;
pub mod jail;
pub mod shell;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::SandboxSection;
use crate::core::SandboxError;

pub use fs::{DeleteReport, DirEntryInfo, FileContent, Listing, SafeFs, WriteReport};
pub use jail::PathJail;
pub use shell::{AllowedSubcommands, CommandOutput, CommandRunner, CURRENT_IDENTITY};

/// 大小与超时上限
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub max_read_lines: usize,
    pub max_read_bytes: usize,
    pub max_write_bytes: usize,
    pub max_list_entries: usize,
    pub max_output_bytes: usize,
    pub command_timeout_secs: u64,
    pub max_command_timeout_secs: u64,
    pub delete_confirm_phrase: String,
}

impl From<&SandboxSection> for SandboxLimits {
    fn from(s: &SandboxSection) -> Self {
        Self {
            max_read_lines: s.max_read_lines,
            max_read_bytes: s.max_read_bytes,
            max_write_bytes: s.max_write_bytes,
            max_list_entries: s.max_list_entries,
            max_output_bytes: s.max_output_bytes,
            command_timeout_secs: s.command_timeout_secs,
            max_command_timeout_secs: s.max_command_timeout_secs,
            delete_confirm_phrase: s.delete_confirm_phrase.clone(),
        }
    }
}

/// fs 与 shell 共享的状态
pub(crate) struct SandboxContext {
    pub(crate) jail: PathJail,
    pub(crate) shadow_root: PathBuf,
    simulate: AtomicBool,
    /// simulate 模式下被删除的真实文件（jail 内相对路径）
    tombstones: Mutex<HashSet<PathBuf>>,
    pub(crate) limits: SandboxLimits,
}

impl SandboxContext {
    pub(crate) fn is_simulating(&self) -> bool {
        self.simulate.load(Ordering::SeqCst)
    }

    /// 写入目标根：simulate 时为影子树
    pub(crate) fn write_root(&self) -> PathBuf {
        if self.is_simulating() {
            self.shadow_root.clone()
        } else {
            self.jail.root().to_path_buf()
        }
    }

    /// simulate 模式下该路径是否已被模拟删除
    pub(crate) fn is_tombstoned(&self, rel: &Path) -> bool {
        self.is_simulating()
            && self
                .tombstones
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(rel)
    }

    pub(crate) fn bury(&self, rel: &Path) {
        self.tombstones
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(rel.to_path_buf());
    }

    pub(crate) fn unbury(&self, rel: &Path) {
        self.tombstones
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(rel);
    }

    /// 读取位置 (根, 完整路径)：simulate 且影子副本存在时读影子，否则读真实 jail
    pub(crate) fn read_location(&self, rel: &Path) -> (PathBuf, PathBuf) {
        if self.is_simulating() {
            let shadow = self.shadow_root.join(rel);
            if shadow.exists() {
                return (self.shadow_root.clone(), shadow);
            }
        }
        let root = self.jail.root().to_path_buf();
        let full = root.join(rel);
        (root, full)
    }
}

/// 未配置影子根时取 jail 根旁的 `.<name>-shadow`
fn default_shadow_root(root: &Path) -> PathBuf {
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "jail".to_string());
    match root.parent() {
        Some(parent) => parent.join(format!(".{name}-shadow")),
        None => root.join(".shadow"),
    }
}

/// 沙箱执行器（文件操作 + 命令执行）
pub struct SandboxedExecutor {
    ctx: Arc<SandboxContext>,
    fs: SafeFs,
    runner: CommandRunner,
}

impl SandboxedExecutor {
    pub fn new(section: &SandboxSection) -> Result<Self, SandboxError> {
        let jail = PathJail::new(
            &section.jail_root,
            &section.blocked_dirs,
            &section.blocked_files,
            &section.blocked_extensions,
        )?;
        let shadow_root = section
            .shadow_root
            .clone()
            .unwrap_or_else(|| default_shadow_root(jail.root()));
        if shadow_root.starts_with(jail.root()) {
            return Err(SandboxError::PathEscape(format!(
                "shadow root {} must live outside the jail",
                shadow_root.display()
            )));
        }

        tracing::info!(
            root = %jail.root().display(),
            shadow = %shadow_root.display(),
            simulate = section.simulate,
            "sandbox ready"
        );
        let ctx = Arc::new(SandboxContext {
            jail,
            shadow_root,
            simulate: AtomicBool::new(section.simulate),
            tombstones: Mutex::new(HashSet::new()),
            limits: SandboxLimits::from(section),
        });
        Ok(Self {
            fs: SafeFs::new(Arc::clone(&ctx)),
            runner: CommandRunner::new(Arc::clone(&ctx), &section.allowed_commands),
            ctx,
        })
    }

    pub fn root(&self) -> &Path {
        self.ctx.jail.root()
    }

    pub fn shadow_root(&self) -> &Path {
        &self.ctx.shadow_root
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.ctx.limits
    }

    pub fn set_simulate(&self, simulate: bool) {
        self.ctx.simulate.store(simulate, Ordering::SeqCst);
        tracing::info!(simulate, "sandbox mode changed");
    }

    pub fn is_simulating(&self) -> bool {
        self.ctx.is_simulating()
    }

    pub fn read_file(&self, path: &str, max_lines: Option<usize>) -> Result<FileContent, SandboxError> {
        self.fs.read_file(path, max_lines)
    }

    pub fn write_file(&self, path: &str, content: &str) -> Result<WriteReport, SandboxError> {
        self.fs.write_file(path, content)
    }

    pub fn list_directory(
        &self,
        path: &str,
        recursive: bool,
        max_depth: Option<usize>,
    ) -> Result<Listing, SandboxError> {
        self.fs.list_directory(path, recursive, max_depth)
    }

    pub fn delete_file(
        &self,
        path: &str,
        confirm: bool,
        confirm_phrase: &str,
    ) -> Result<DeleteReport, SandboxError> {
        self.fs.delete_file(path, confirm, confirm_phrase)
    }

    pub async fn run_command(
        &self,
        command: &str,
        timeout_secs: Option<u64>,
    ) -> Result<CommandOutput, SandboxError> {
        self.runner.run(command, timeout_secs).await
    }

    /// 命令执行器当前工作目录（jail 内相对路径）
    pub fn cwd(&self) -> PathBuf {
        self.runner.cwd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(dir: &Path) -> SandboxedExecutor {
        let section = SandboxSection {
            jail_root: dir.join("jail"),
            shadow_root: Some(dir.join("shadow")),
            ..SandboxSection::default()
        };
        SandboxedExecutor::new(&section).unwrap()
    }

    fn snapshot(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
        let mut out: Vec<_> = walkdir::WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| {
                let bytes = if e.file_type().is_file() {
                    std::fs::read(e.path()).unwrap_or_default()
                } else {
                    Vec::new()
                };
                (e.path().to_path_buf(), bytes)
            })
            .collect();
        out.sort();
        out
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let sb = executor(dir.path());
        let report = sb.write_file("notes/a.txt", "line1\nline2\n").unwrap();
        assert_eq!(report.bytes, 12);
        assert!(!report.simulated);
        let read = sb.read_file("notes/a.txt", None).unwrap();
        assert_eq!(read.content, "line1\nline2\n");
        assert_eq!(read.total_lines, 2);
        assert!(!read.truncated);

        sb.write_file("notes/a.txt", "replaced").unwrap();
        assert_eq!(sb.read_file("notes/a.txt", None).unwrap().content, "replaced");
    }

    #[test]
    fn test_read_line_limit() {
        let dir = tempfile::tempdir().unwrap();
        let sb = executor(dir.path());
        sb.write_file("big.txt", "a\nb\nc\nd\n").unwrap();
        let read = sb.read_file("big.txt", Some(2)).unwrap();
        assert_eq!(read.content, "a\nb\n");
        assert_eq!(read.total_lines, 4);
        assert!(read.truncated);
    }

    #[test]
    fn test_escape_leaves_filesystem_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let sb = executor(dir.path());
        sb.write_file("keep.txt", "x").unwrap();
        let before = snapshot(dir.path());

        assert!(matches!(
            sb.write_file("../outside.txt", "pwned"),
            Err(SandboxError::PathEscape(_))
        ));
        assert!(matches!(
            sb.read_file("../../etc/passwd", None),
            Err(SandboxError::PathEscape(_))
        ));
        assert!(matches!(
            sb.delete_file("../keep.txt", true, "DELETE"),
            Err(SandboxError::PathEscape(_))
        ));
        assert!(matches!(
            sb.list_directory("..", false, None),
            Err(SandboxError::PathEscape(_))
        ));
        assert_eq!(before, snapshot(dir.path()));
    }

    #[test]
    fn test_blocked_paths() {
        let dir = tempfile::tempdir().unwrap();
        let sb = executor(dir.path());
        assert!(matches!(sb.write_file(".git/config", "x"), Err(SandboxError::BlockedPath(_))));
        assert!(matches!(sb.read_file(".env", None), Err(SandboxError::BlockedPath(_))));
        assert!(matches!(
            sb.write_file("tool.exe", "MZ"),
            Err(SandboxError::BlockedExtension(_))
        ));
    }

    #[test]
    fn test_listing_hides_blocked_entries() {
        let dir = tempfile::tempdir().unwrap();
        let sb = executor(dir.path());
        sb.write_file("src/main.rs", "fn main() {}").unwrap();
        std::fs::create_dir_all(sb.root().join(".git")).unwrap();
        std::fs::write(sb.root().join(".env"), "SECRET=1").unwrap();

        let listing = sb.list_directory(".", true, None).unwrap();
        let paths: Vec<_> = listing.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["src", "src/main.rs"]);
        assert!(listing.entries[0].is_dir);
    }

    #[test]
    fn test_list_entry_cap() {
        let dir = tempfile::tempdir().unwrap();
        let section = SandboxSection {
            jail_root: dir.path().join("jail"),
            shadow_root: Some(dir.path().join("shadow")),
            max_list_entries: 2,
            ..SandboxSection::default()
        };
        let sb = SandboxedExecutor::new(&section).unwrap();
        for name in ["a", "b", "c"] {
            sb.write_file(name, name).unwrap();
        }
        let listing = sb.list_directory("", false, None).unwrap();
        assert_eq!(listing.entries.len(), 2);
        assert!(listing.truncated);
    }

    #[test]
    fn test_write_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let section = SandboxSection {
            jail_root: dir.path().join("jail"),
            shadow_root: Some(dir.path().join("shadow")),
            max_write_bytes: 4,
            ..SandboxSection::default()
        };
        let sb = SandboxedExecutor::new(&section).unwrap();
        assert!(matches!(
            sb.write_file("a.txt", "too long"),
            Err(SandboxError::TooLarge { limit: 4, .. })
        ));
        assert!(!sb.root().join("a.txt").exists());
    }

    #[test]
    fn test_delete_requires_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let sb = executor(dir.path());
        sb.write_file("victim.txt", "x").unwrap();

        assert!(matches!(
            sb.delete_file("victim.txt", false, "DELETE"),
            Err(SandboxError::ConfirmationRequired)
        ));
        assert!(matches!(
            sb.delete_file("victim.txt", true, "delete"),
            Err(SandboxError::ConfirmationRequired)
        ));
        assert!(sb.root().join("victim.txt").exists());

        let report = sb.delete_file("victim.txt", true, "DELETE").unwrap();
        assert!(!report.simulated);
        assert!(!sb.root().join("victim.txt").exists());
        assert!(matches!(
            sb.delete_file("victim.txt", true, "DELETE"),
            Err(SandboxError::NotFound(_))
        ));
    }

    #[test]
    fn test_simulate_redirects_to_shadow() {
        let dir = tempfile::tempdir().unwrap();
        let sb = executor(dir.path());
        sb.write_file("live.txt", "original").unwrap();

        sb.set_simulate(true);
        let report = sb.write_file("live.txt", "changed").unwrap();
        assert!(report.simulated);
        sb.write_file("new.txt", "fresh").unwrap();

        // 真实 jail 未被修改，影子树有副本
        assert_eq!(std::fs::read_to_string(sb.root().join("live.txt")).unwrap(), "original");
        assert!(!sb.root().join("new.txt").exists());
        assert_eq!(
            std::fs::read_to_string(sb.shadow_root().join("live.txt")).unwrap(),
            "changed"
        );
        // simulate 下读取优先影子副本
        assert_eq!(sb.read_file("live.txt", None).unwrap().content, "changed");

        // 只存在于真实 jail 的文件：删除仅被模拟
        sb.write_file("other.txt", "x").unwrap();
        std::fs::remove_file(sb.shadow_root().join("other.txt")).unwrap();
        std::fs::write(sb.root().join("other.txt"), "x").unwrap();
        let del = sb.delete_file("other.txt", true, "DELETE").unwrap();
        assert!(del.simulated);
        assert!(sb.root().join("other.txt").exists());

        sb.set_simulate(false);
        assert_eq!(sb.read_file("live.txt", None).unwrap().content, "original");
    }

    #[test]
    fn test_shadow_inside_jail_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("jail")).unwrap();
        let root = dir.path().join("jail").canonicalize().unwrap();
        let section = SandboxSection {
            jail_root: root.clone(),
            shadow_root: Some(root.join("shadow")),
            ..SandboxSection::default()
        };
        assert!(SandboxedExecutor::new(&section).is_err());
    }

    #[test]
    fn test_default_shadow_root_is_sibling() {
        let shadow = default_shadow_root(Path::new("/srv/work"));
        assert_eq!(shadow, PathBuf::from("/srv/.work-shadow"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_allow_list() {
        let dir = tempfile::tempdir().unwrap();
        let sb = executor(dir.path());
        sb.write_file("keep.txt", "data").unwrap();

        for cmd in ["rm -rf /", "rm keep.txt", "curl http://example.com", ""] {
            assert!(
                matches!(sb.run_command(cmd, None).await, Err(SandboxError::CommandNotAllowed(_))),
                "{cmd:?} should be rejected"
            );
        }
        assert!(matches!(
            sb.run_command("ls; rm keep.txt", None).await,
            Err(SandboxError::CommandNotAllowed(_))
        ));
        assert!(matches!(
            sb.run_command("git push", None).await,
            Err(SandboxError::CommandNotAllowed(_))
        ));
        assert!(matches!(
            sb.run_command("cat ../../etc/passwd", None).await,
            Err(SandboxError::PathEscape(_))
        ));
        assert!(matches!(
            sb.run_command("cat .env", None).await,
            Err(SandboxError::BlockedPath(_))
        ));
        assert!(sb.root().join("keep.txt").exists());

        let out = sb.run_command("cat keep.txt", None).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "data");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cd_tracks_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sb = executor(dir.path());
        sb.write_file("sub/inner.txt", "hi").unwrap();

        assert!(matches!(
            sb.run_command("cd ..", None).await,
            Err(SandboxError::PathEscape(_))
        ));
        assert!(matches!(
            sb.run_command("cd missing", None).await,
            Err(SandboxError::NotFound(_))
        ));

        let out = sb.run_command("cd sub", None).await.unwrap();
        assert_eq!(out.cwd, "/sub");
        assert_eq!(sb.cwd(), PathBuf::from("sub"));

        let ls = sb.run_command("ls", None).await.unwrap();
        assert!(ls.stdout.contains("inner.txt"));
        assert_eq!(sb.run_command("pwd", None).await.unwrap().stdout, "/sub");

        // 从子目录出发的相对逃逸同样被拒绝
        assert!(matches!(
            sb.run_command("cat ../../x", None).await,
            Err(SandboxError::PathEscape(_))
        ));

        sb.run_command("cd", None).await.unwrap();
        assert_eq!(sb.cwd(), PathBuf::new());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_timeout_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let mut section = SandboxSection {
            jail_root: dir.path().join("jail"),
            shadow_root: Some(dir.path().join("shadow")),
            max_output_bytes: 4,
            ..SandboxSection::default()
        };
        section
            .allowed_commands
            .insert("sleep".to_string(), vec!["*".to_string()]);
        let sb = SandboxedExecutor::new(&section).unwrap();

        assert!(matches!(
            sb.run_command("sleep 5", Some(1)).await,
            Err(SandboxError::CommandTimeout(1))
        ));

        let out = sb.run_command("echo abcdefgh", None).await.unwrap();
        assert_eq!(out.stdout, "abcd");
        assert!(out.truncated);

        // 远超管道缓冲的输出也只保留上限内的字节
        sb.write_file("big.txt", &"x".repeat(512 * 1024)).unwrap();
        let out = sb.run_command("cat big.txt", None).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "xxxx");
        assert!(out.truncated);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_capable_arguments_refused() {
        let dir = tempfile::tempdir().unwrap();
        let sb = executor(dir.path());
        sb.write_file("keep.txt", "data").unwrap();
        std::fs::write(dir.path().join("secret_outside.txt"), "TOPSECRET").unwrap();

        for cmd in [
            "find . -maxdepth 0 -exec sh -c cat$IFS../secret_outside.txt {} +",
            "find . -exec cat {} +",
            "find . -execdir cat {} +",
            "find . -ok cat {} +",
            "find . -delete",
            "find . -fprint listing.txt",
            "echo $HOME",
            "cat ${HOME}/.ssh/id_rsa",
            "git log --output=log.txt",
            "git diff --ext-diff",
        ] {
            let err = sb.run_command(cmd, None).await.unwrap_err();
            assert!(matches!(err, SandboxError::CommandNotAllowed(_)), "{cmd}: {err}");
        }
        assert!(sb.root().join("keep.txt").exists());
        assert!(!sb.root().join("listing.txt").exists());
        assert!(!sb.root().join("log.txt").exists());

        let out = sb.run_command("find . -name keep.txt", None).await.unwrap();
        assert!(out.stdout.contains("keep.txt"));
        assert!(!out.stdout.contains("TOPSECRET"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_working_directory_is_per_identity() {
        let dir = tempfile::tempdir().unwrap();
        let sb = executor(dir.path());
        sb.write_file("sub/inner.txt", "hi").unwrap();

        let alice = CURRENT_IDENTITY
            .scope("alice".to_string(), async {
                sb.run_command("cd sub", None).await.unwrap();
                sb.cwd()
            })
            .await;
        assert_eq!(alice, PathBuf::from("sub"));

        let bob = CURRENT_IDENTITY
            .scope("bob".to_string(), async {
                sb.run_command("pwd", None).await.unwrap().stdout
            })
            .await;
        assert_eq!(bob, "/");
        assert_eq!(sb.cwd(), PathBuf::new());

        let alice_again = CURRENT_IDENTITY
            .scope("alice".to_string(), async {
                sb.run_command("pwd", None).await.unwrap().stdout
            })
            .await;
        assert_eq!(alice_again, "/sub");
    }

    #[test]
    fn test_simulated_delete_hides_live_file() {
        let dir = tempfile::tempdir().unwrap();
        let sb = executor(dir.path());
        sb.write_file("doomed.txt", "original").unwrap();
        sb.write_file("kept.txt", "kept").unwrap();

        sb.set_simulate(true);
        assert!(sb.delete_file("doomed.txt", true, "DELETE").unwrap().simulated);
        assert!(matches!(
            sb.read_file("doomed.txt", None),
            Err(SandboxError::NotFound(_))
        ));
        let listing = sb.list_directory(".", false, None).unwrap();
        let names: Vec<&str> = listing.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(names, vec!["kept.txt"]);
        assert!(matches!(
            sb.delete_file("doomed.txt", true, "DELETE"),
            Err(SandboxError::NotFound(_))
        ));
        assert!(sb.root().join("doomed.txt").exists());

        // 模拟中重新写入后可见
        sb.write_file("doomed.txt", "reborn").unwrap();
        assert_eq!(sb.read_file("doomed.txt", None).unwrap().content, "reborn");

        sb.set_simulate(false);
        assert_eq!(sb.read_file("doomed.txt", None).unwrap().content, "original");
    }
}
