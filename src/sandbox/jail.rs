//! 路径 jail
//!
//! 调用方给出的路径先做纯词法规范化（不要求目标存在），规范化结果必须是 jail 根的后代；
//! 再逐段匹配屏蔽列表（版本库目录、依赖缓存、密钥文件、二进制后缀）。
//! 落盘前另以 canonicalize 校验最深的已存在祖先，防止符号链接把路径带出 jail。

use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use crate::core::SandboxError;

#[derive(Debug, Clone)]
pub struct PathJail {
    root: PathBuf,
    blocked_dirs: HashSet<String>,
    blocked_files: HashSet<String>,
    blocked_extensions: Vec<String>,
}

impl PathJail {
    /// 根目录不存在时创建，并取其规范路径
    pub fn new(
        root: impl AsRef<Path>,
        blocked_dirs: &[String],
        blocked_files: &[String],
        blocked_extensions: &[String],
    ) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = root.as_ref().canonicalize()?;
        Ok(Self {
            root,
            blocked_dirs: blocked_dirs.iter().map(|s| s.to_lowercase()).collect(),
            blocked_files: blocked_files.iter().map(|s| s.to_lowercase()).collect(),
            blocked_extensions: blocked_extensions
                .iter()
                .map(|e| {
                    let e = e.to_lowercase();
                    if e.starts_with('.') {
                        e
                    } else {
                        format!(".{e}")
                    }
                })
                .collect(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 以 jail 内相对目录 base 为起点规范化 input，返回 jail 内相对路径（空路径即根）
    pub fn normalize(&self, base: &Path, input: &str) -> Result<PathBuf, SandboxError> {
        let input = input.trim();
        let raw = Path::new(input);
        let (start, rest): (Vec<&OsStr>, &Path) = if raw.is_absolute() {
            match raw.strip_prefix(&self.root) {
                Ok(rest) => (Vec::new(), rest),
                Err(_) => return Err(SandboxError::PathEscape(input.to_string())),
            }
        } else {
            (
                base.components()
                    .filter_map(|c| match c {
                        Component::Normal(s) => Some(s),
                        _ => None,
                    })
                    .collect(),
                raw,
            )
        };

        let mut stack = start;
        for comp in rest.components() {
            match comp {
                Component::CurDir => {}
                Component::ParentDir => {
                    if stack.pop().is_none() {
                        return Err(SandboxError::PathEscape(input.to_string()));
                    }
                }
                Component::Normal(s) => stack.push(s),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(SandboxError::PathEscape(input.to_string()));
                }
            }
        }
        Ok(stack.iter().collect())
    }

    /// 相对 jail 根解析：规范化 + 屏蔽列表检查
    pub fn resolve(&self, input: &str) -> Result<PathBuf, SandboxError> {
        let rel = self.normalize(Path::new(""), input)?;
        self.check_blocked(&rel)?;
        Ok(rel)
    }

    pub fn is_blocked_name(&self, name: &OsStr) -> bool {
        let name = name.to_string_lossy().to_lowercase();
        self.blocked_dirs.contains(&name)
            || self
                .blocked_files
                .iter()
                .any(|f| name == *f || name.starts_with(&format!("{f}.")))
    }

    fn blocked_extension(&self, name: &OsStr) -> Option<&str> {
        let name = name.to_string_lossy().to_lowercase();
        self.blocked_extensions
            .iter()
            .find(|ext| name.ends_with(ext.as_str()))
            .map(|s| s.as_str())
    }

    pub fn check_blocked(&self, rel: &Path) -> Result<(), SandboxError> {
        for comp in rel.components() {
            if let Component::Normal(name) = comp {
                if self.is_blocked_name(name) {
                    return Err(SandboxError::BlockedPath(rel.display().to_string()));
                }
            }
        }
        if let Some(name) = rel.file_name() {
            if let Some(ext) = self.blocked_extension(name) {
                return Err(SandboxError::BlockedExtension(format!(
                    "{} ({ext})",
                    rel.display()
                )));
            }
        }
        Ok(())
    }
}

/// 校验 full 最深的已存在祖先经 canonicalize 后仍在 base_root 下
pub fn ensure_within(base_root: &Path, full: &Path) -> Result<(), SandboxError> {
    let root = base_root
        .canonicalize()
        .unwrap_or_else(|_| base_root.to_path_buf());
    let mut probe = Some(full);
    while let Some(p) = probe {
        if p.symlink_metadata().is_ok() {
            let real = p.canonicalize()?;
            return if real.starts_with(&root) {
                Ok(())
            } else {
                Err(SandboxError::PathEscape(full.display().to_string()))
            };
        }
        probe = p.parent();
    }
    Ok(())
}
