//! S3上传协商
//!
//! 小文件直接预签名 PUT，大文件交给客户端分片上传；开启中转上传时统一走网关。

use std::sync::Arc;
use std::time::Duration;

use super::client::{CompletedPart, ObjectStore};
use crate::error::{DriveError, Result};
use crate::storage::ops::require_file_not_exists;
use crate::storage::{Drive, DriveCache, UploadAction, UploadConfig, UploadParams};
use crate::utils::{clean_path, is_root_path, path_parent};

/// 超过该大小改用分片上传
pub const DIRECT_UPLOAD_THRESHOLD: i64 = 5 * 1024 * 1024;
/// 上传URL有效期
pub const UPLOAD_URL_TTL: Duration = Duration::from_secs(2 * 60 * 60);
/// 下载URL有效期
pub const DOWNLOAD_URL_TTL: Duration = Duration::from_secs(8 * 60 * 60);

/// 解析 `;` 分隔的分片标签，每个元素按顺序编号，从1开始
pub fn build_complete_parts(parts: &str) -> Result<Vec<CompletedPart>> {
    parts
        .split(';')
        .map(str::trim)
        .enumerate()
        .map(|(i, tag)| {
            if tag.is_empty() {
                return Err(DriveError::InvalidArgument(format!("part {} has no etag", i + 1)));
            }
            Ok(CompletedPart {
                part_number: i as i64 + 1,
                etag: tag.to_string(),
            })
        })
        .collect()
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(DriveError::InvalidArgument(format!("{} is required", name))),
    }
}

/// 上传协商器
pub struct UploadNegotiator {
    store: Arc<dyn ObjectStore>,
    proxy_upload: bool,
}

impl UploadNegotiator {
    pub fn new(store: Arc<dyn ObjectStore>, proxy_upload: bool) -> Self {
        Self { store, proxy_upload }
    }

    pub async fn negotiate(
        &self,
        drive: &dyn Drive,
        cache: &dyn DriveCache,
        path: &str,
        size: i64,
        overwrite: bool,
        params: &UploadParams,
    ) -> Result<Option<UploadConfig>> {
        let path = clean_path(path);
        if is_root_path(&path) {
            return Err(DriveError::InvalidArgument("upload path is empty".into()));
        }
        let action = params.action();

        // 先校验参数，再检查目标
        match action {
            UploadAction::Initial if size < 0 => {
                return Err(DriveError::InvalidArgument(format!("invalid size: {}", size)));
            }
            UploadAction::UploadPart => {
                required(&params.upload_id, "uploadId")?;
                match params.seq {
                    Some(seq) if seq >= 0 => {}
                    _ => return Err(DriveError::InvalidArgument("seq must be >= 0".into())),
                }
            }
            UploadAction::CompleteMultipartUpload => {
                required(&params.upload_id, "uploadId")?;
                required(&params.parts, "parts")?;
            }
            UploadAction::AbortMultipartUpload => {
                required(&params.upload_id, "uploadId")?;
            }
            _ => {}
        }

        if action.issues_plan() && !overwrite {
            require_file_not_exists(drive, &path).await?;
        }

        match action {
            UploadAction::Initial => self.initial(&path, size).map(Some),
            UploadAction::UploadPart => {
                let upload_id = required(&params.upload_id, "uploadId")?;
                let part_number = (params.seq.unwrap_or_default() + 1).to_string();
                let url = self.store.presign(
                    "PUT",
                    &path,
                    &[("partNumber", part_number.as_str()), ("uploadId", upload_id)],
                    UPLOAD_URL_TTL,
                )?;
                Ok(Some(UploadConfig::direct(url)))
            }
            UploadAction::CompleteMultipartUpload => {
                let upload_id = required(&params.upload_id, "uploadId")?;
                let parts = build_complete_parts(required(&params.parts, "parts")?)?;
                tracing::debug!(
                    "S3 CompleteMultipartUpload: key={}, upload_id={}, parts={}",
                    path,
                    upload_id,
                    parts.len()
                );
                let result = self
                    .store
                    .complete_multipart_upload(&path, upload_id, &parts)
                    .await;
                evict_with_parent(cache, &path);
                result.map(|_| None)
            }
            UploadAction::AbortMultipartUpload => {
                let upload_id = required(&params.upload_id, "uploadId")?;
                tracing::debug!("S3 AbortMultipartUpload: key={}, upload_id={}", path, upload_id);
                self.store.abort_multipart_upload(&path, upload_id).await?;
                Ok(None)
            }
            UploadAction::CompletePutObject => {
                evict_with_parent(cache, &path);
                Ok(None)
            }
        }
    }

    fn initial(&self, path: &str, size: i64) -> Result<UploadConfig> {
        if self.proxy_upload {
            return Ok(UploadConfig::local_proxy(size));
        }
        if size <= DIRECT_UPLOAD_THRESHOLD {
            let url = self.store.presign("PUT", path, &[], UPLOAD_URL_TTL)?;
            return Ok(UploadConfig::direct(url));
        }
        let url = self
            .store
            .presign("POST", path, &[("uploads", "")], UPLOAD_URL_TTL)?;
        Ok(UploadConfig::direct(url).with("multipart", "1"))
    }
}

fn evict_with_parent(cache: &dyn DriveCache, path: &str) {
    cache.evict(path, false);
    cache.evict(&path_parent(path), false);
}
