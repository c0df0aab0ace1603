//! 沙箱文件操作：read / write / list / delete
//!
//! 所有路径先经 PathJail 解析；simulate 模式下写入与删除落到影子树，读取优先影子副本，
//! 模拟删除过的真实文件按不存在处理。

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use walkdir::WalkDir;

use crate::core::SandboxError;
use crate::sandbox::jail::ensure_within;
use crate::sandbox::SandboxContext;

/// 递归列目录且未指定 max_depth 时的默认深度
const DEFAULT_LIST_DEPTH: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub total_lines: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteReport {
    pub path: String,
    pub bytes: usize,
    pub simulated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirEntryInfo {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub path: String,
    pub entries: Vec<DirEntryInfo>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub path: String,
    pub simulated: bool,
}

/// 沙箱文件系统
#[derive(Clone)]
pub struct SafeFs {
    ctx: Arc<SandboxContext>,
}

fn rel_display(rel: &Path) -> String {
    if rel.as_os_str().is_empty() {
        ".".to_string()
    } else {
        rel.to_string_lossy().replace('\\', "/")
    }
}

fn not_a_file(rel: &Path) -> SandboxError {
    SandboxError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("{} is a directory", rel_display(rel)),
    ))
}

impl SafeFs {
    pub(crate) fn new(ctx: Arc<SandboxContext>) -> Self {
        Self { ctx }
    }

    /// 读文件，按行数与字节数双重截断；max_lines 不能超过配置上限
    pub fn read_file(&self, path: &str, max_lines: Option<usize>) -> Result<FileContent, SandboxError> {
        let rel = self.ctx.jail.resolve(path)?;
        let (root, full) = self.ctx.read_location(&rel);
        ensure_within(&root, &full)?;
        if !full.exists() || self.ctx.is_tombstoned(&rel) {
            return Err(SandboxError::NotFound(rel_display(&rel)));
        }
        if full.is_dir() {
            return Err(not_a_file(&rel));
        }

        let limits = &self.ctx.limits;
        let file = std::fs::File::open(&full)?;
        let size = file.metadata()?.len();
        let mut buf = Vec::new();
        file.take(limits.max_read_bytes as u64).read_to_end(&mut buf)?;
        let text = String::from_utf8_lossy(&buf).into_owned();

        let line_limit = max_lines
            .unwrap_or(limits.max_read_lines)
            .clamp(1, limits.max_read_lines.max(1));
        let total_lines = text.split_inclusive('\n').count();
        let (content, line_truncated) = if total_lines > line_limit {
            (text.split_inclusive('\n').take(line_limit).collect::<String>(), true)
        } else {
            (text, false)
        };

        tracing::debug!(path = %rel_display(&rel), bytes = buf.len(), "sandbox read");
        Ok(FileContent {
            path: rel_display(&rel),
            content,
            total_lines,
            truncated: line_truncated || size > limits.max_read_bytes as u64,
        })
    }

    /// 整体替换写入：先写同目录临时文件再 rename，外部看不到半写状态
    pub fn write_file(&self, path: &str, content: &str) -> Result<WriteReport, SandboxError> {
        let rel = self.ctx.jail.resolve(path)?;
        let limits = &self.ctx.limits;
        if content.len() > limits.max_write_bytes {
            return Err(SandboxError::TooLarge {
                what: format!("content for {}", rel_display(&rel)),
                limit: limits.max_write_bytes,
            });
        }
        let file_name = match rel.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => return Err(not_a_file(&rel)),
        };

        let root = self.ctx.write_root();
        std::fs::create_dir_all(&root)?;
        let full = root.join(&rel);
        ensure_within(&root, &full)?;
        if full.is_dir() {
            return Err(not_a_file(&rel));
        }
        let parent = full.parent().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
        std::fs::create_dir_all(&parent)?;
        ensure_within(&root, &parent)?;

        let tmp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
        if let Err(e) = std::fs::write(&tmp, content.as_bytes()) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        if let Err(e) = std::fs::rename(&tmp, &full) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }

        let simulated = self.ctx.is_simulating();
        if simulated {
            self.ctx.unbury(&rel);
        }
        tracing::info!(path = %rel_display(&rel), bytes = content.len(), simulated, "sandbox write");
        Ok(WriteReport {
            path: rel_display(&rel),
            bytes: content.len(),
            simulated,
        })
    }

    /// 列目录；recursive 时最深 max_depth 层（默认 3），屏蔽项不出现在结果中
    pub fn list_directory(
        &self,
        path: &str,
        recursive: bool,
        max_depth: Option<usize>,
    ) -> Result<Listing, SandboxError> {
        let rel = self.ctx.jail.resolve(path)?;
        let (root, full) = self.ctx.read_location(&rel);
        ensure_within(&root, &full)?;
        if !full.exists() || self.ctx.is_tombstoned(&rel) {
            return Err(SandboxError::NotFound(rel_display(&rel)));
        }
        if !full.is_dir() {
            return Err(SandboxError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a directory", rel_display(&rel)),
            )));
        }

        let depth = if recursive {
            max_depth.unwrap_or(DEFAULT_LIST_DEPTH).max(1)
        } else {
            1
        };
        let max_entries = self.ctx.limits.max_list_entries;
        let jail = &self.ctx.jail;

        let mut entries = Vec::new();
        let mut truncated = false;
        let walker = WalkDir::new(&full)
            .min_depth(1)
            .max_depth(depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !jail.is_blocked_name(e.file_name()));
        for entry in walker {
            let entry = entry.map_err(|e| {
                SandboxError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            })?;
            if entries.len() >= max_entries {
                truncated = true;
                break;
            }
            let relative: PathBuf = entry
                .path()
                .strip_prefix(&root)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| entry.path().to_path_buf());
            if self.ctx.is_tombstoned(&relative) {
                continue;
            }
            let meta = entry.metadata().ok();
            entries.push(DirEntryInfo {
                path: rel_display(&relative),
                is_dir: entry.file_type().is_dir(),
                size: meta.map(|m| m.len()).unwrap_or(0),
            });
        }

        Ok(Listing {
            path: rel_display(&rel),
            entries,
            truncated,
        })
    }

    /// 删除单个文件；需 confirm=true 且短语与配置完全一致
    pub fn delete_file(
        &self,
        path: &str,
        confirm: bool,
        confirm_phrase: &str,
    ) -> Result<DeleteReport, SandboxError> {
        let rel = self.ctx.jail.resolve(path)?;
        if !confirm || confirm_phrase != self.ctx.limits.delete_confirm_phrase {
            return Err(SandboxError::ConfirmationRequired);
        }
        if rel.as_os_str().is_empty() {
            return Err(not_a_file(&rel));
        }

        if self.ctx.is_simulating() {
            let shadow = self.ctx.shadow_root.join(&rel);
            ensure_within(&self.ctx.shadow_root, &shadow)?;
            let live = self.ctx.jail.root().join(&rel);
            let live_visible = live.is_file() && !self.ctx.is_tombstoned(&rel);
            if shadow.is_file() {
                std::fs::remove_file(&shadow)?;
            } else if !live_visible {
                return Err(SandboxError::NotFound(rel_display(&rel)));
            }
            if live.is_file() {
                self.ctx.bury(&rel);
            }
            tracing::info!(path = %rel_display(&rel), "sandbox delete (simulated)");
            return Ok(DeleteReport {
                path: rel_display(&rel),
                simulated: true,
            });
        }

        let full = self.ctx.jail.root().join(&rel);
        ensure_within(self.ctx.jail.root(), &full)?;
        if !full.exists() {
            return Err(SandboxError::NotFound(rel_display(&rel)));
        }
        if full.is_dir() {
            return Err(not_a_file(&rel));
        }
        std::fs::remove_file(&full)?;
        tracing::info!(path = %rel_display(&rel), "sandbox delete");
        Ok(DeleteReport {
            path: rel_display(&rel),
            simulated: false,
        })
    }
}
