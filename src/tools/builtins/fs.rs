use anyhow::{Context, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};

pub struct FsTools {
    workspace_root: PathBuf,
}

impl FsTools {
    pub fn new(workspace_root: PathBuf) -> Self {
        FsTools { workspace_root }
    }

    /// 解析路径，确保在 workspace 内
    fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        // 移除前导斜杠，避免绝对路径
        let clean_path = Path::new(path.trim_start_matches('/'));

        if clean_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(anyhow::anyhow!("路径超出 workspace 范围：{}", path));
        }

        let full_path = self.workspace_root.join(clean_path);

        // 符号链接可能指向 workspace 之外：取最近的已存在祖先做 canonicalize
        let root = self
            .workspace_root
            .canonicalize()
            .unwrap_or_else(|_| self.workspace_root.clone());
        let mut existing = full_path.as_path();
        while existing != self.workspace_root.as_path()
            && existing.symlink_metadata().is_err()
        {
            match existing.parent() {
                Some(parent) => existing = parent,
                None => break,
            }
        }
        if existing != self.workspace_root.as_path() || existing.exists() {
            let real = existing
                .canonicalize()
                .with_context(|| format!("无法解析路径：{}", path))?;
            if !real.starts_with(&root) {
                return Err(anyhow::anyhow!("路径超出 workspace 范围：{}", path));
            }
        }

        Ok(full_path)
    }

    pub fn read(&self, path: &str) -> Result<String> {
        let full_path = self.resolve_path(path)?;
        fs::read_to_string(&full_path).with_context(|| format!("读取文件失败：{}", path))
    }

    pub fn write(&self, path: &str, content: &str) -> Result<String> {
        let full_path = self.resolve_path(path)?;

        // 确保父目录存在
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&full_path, content).with_context(|| format!("写入文件失败：{}", path))?;
        Ok(format!("文件已写入：{}", path))
    }

    pub fn patch(&self, path: &str, old_string: &str, new_string: &str) -> Result<String> {
        let full_path = self.resolve_path(path)?;

        let content =
            fs::read_to_string(&full_path).with_context(|| format!("读取文件失败：{}", path))?;

        let match_count = content.matches(old_string).count();

        if match_count == 0 {
            return Err(anyhow::anyhow!("未找到要替换的内容：{}", old_string));
        }

        if match_count > 1 {
            return Err(anyhow::anyhow!(
                "内容出现 {} 次，无法确定替换位置：{}",
                match_count,
                old_string
            ));
        }

        let new_content = content.replacen(old_string, new_string, 1);

        fs::write(&full_path, &new_content).with_context(|| format!("写入文件失败：{}", path))?;

        Ok(format!("文件已更新：{}", path))
    }

    pub fn list(&self, path: &str) -> Result<String> {
        let dir_path = self.resolve_path(path)?;

        if !dir_path.exists() {
            return Err(anyhow::anyhow!("目录不存在：{}", path));
        }

        if !dir_path.is_dir() {
            return Err(anyhow::anyhow!("不是目录：{}", path));
        }

        let entries =
            fs::read_dir(&dir_path).with_context(|| format!("读取目录失败：{}", path))?;

        let mut items = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            items.push(if entry.path().is_dir() {
                format!("📁 {}", name)
            } else {
                format!("📄 {}", name)
            });
        }

        items.sort();
        Ok(items.join("\n"))
    }
}
