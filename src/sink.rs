//! 수신 파일 저장

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::descriptor::TransferDescriptor;
use crate::{Error, Result};

/// 같은 이름의 파일이 있을 때
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverwritePolicy {
    Overwrite,
    /// `name.0`, `name.1`, ... 중 비어 있는 이름 사용
    #[default]
    Rename,
}

/// 새 이름 탐색 한도
const MAX_RENAME_ATTEMPTS: u32 = 1000;

/// 디렉토리에 수신 파일을 저장한다
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
    policy: OverwritePolicy,
}

impl DirectorySink {
    /// 디렉토리가 없으면 만든다
    pub fn new(dir: impl Into<PathBuf>, policy: OverwritePolicy) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, policy })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 저장 경로 결정 (경로 구성요소는 버린다)
    pub fn target_path(&self, descriptor: &TransferDescriptor) -> Result<PathBuf> {
        let name = descriptor.base_name();
        if name.is_empty() || name == "." || name == ".." {
            return Err(Error::Validation(format!("invalid file name {:?}", descriptor.name)));
        }

        let path = self.dir.join(name);
        if self.policy == OverwritePolicy::Overwrite || !path.exists() {
            return Ok(path);
        }
        (0..MAX_RENAME_ATTEMPTS)
            .map(|i| self.dir.join(format!("{}.{}", name, i)))
            .find(|candidate| !candidate.exists())
            .ok_or_else(|| Error::Validation(format!("no free name for {}", name)))
    }

    /// 동기 저장
    pub fn save(&self, descriptor: &TransferDescriptor, payload: &[u8]) -> Result<PathBuf> {
        let path = self.target_path(descriptor)?;
        std::fs::write(&path, payload)?;
        apply_mode(&path, descriptor.mode)?;
        info!("saved {} ({} bytes)", path.display(), payload.len());
        Ok(path)
    }

    /// 비동기 저장
    pub async fn save_async(&self, descriptor: &TransferDescriptor, payload: &[u8]) -> Result<PathBuf> {
        let path = self.target_path(descriptor)?;
        tokio::fs::write(&path, payload).await?;
        apply_mode(&path, descriptor.mode)?;
        info!("saved {} ({} bytes)", path.display(), payload.len());
        Ok(path)
    }
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(mode) = mode {
        let bits = mode & 0o777;
        // 권한 비트가 0이면 무시
        if bits != 0 {
            debug!("chmod {:o} {}", bits, path.display());
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(bits))?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}
