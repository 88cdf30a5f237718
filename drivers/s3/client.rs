//! S3 REST 客户端
//!
//! 驱动只依赖 `ObjectStore`，测试时替换为内存实现。

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tokio_util::io::StreamReader;

use super::config::S3Config;
use super::signer::{canonical_query_string, sha256_hex, uri_encode, Credentials, SigV4Signer};
use crate::error::{DriveError, Result};
use crate::storage::BoxReader;

/// 对象元数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: i64,
    /// 毫秒时间戳
    pub last_modified: Option<i64>,
}

/// 单层列表结果
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub objects: Vec<ObjectMeta>,
    pub common_prefixes: Vec<String>,
}

/// 批量删除中失败的对象
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    pub key: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i64,
    pub etag: String,
}

/// 对象存储后端接口
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head_bucket(&self) -> Result<()>;

    /// 不存在时返回 NotFound
    async fn head_object(&self, key: &str) -> Result<ObjectMeta>;

    /// 按前缀列出，自动翻页
    async fn list_objects(&self, prefix: &str, delimiter: Option<&str>) -> Result<ListResult>;

    async fn get_object(&self, key: &str) -> Result<BoxReader>;

    async fn put_object(&self, key: &str, body: Bytes) -> Result<()>;

    /// 返回 uploadId
    async fn create_multipart_upload(&self, key: &str) -> Result<String>;

    /// 返回分片 ETag
    async fn upload_part(&self, key: &str, upload_id: &str, part_number: i64, body: Bytes) -> Result<String>;

    async fn complete_multipart_upload(&self, key: &str, upload_id: &str, parts: &[CompletedPart]) -> Result<()>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()>;

    /// 服务端复制，返回新对象的修改时间
    async fn copy_object(&self, from_key: &str, to_key: &str) -> Result<Option<i64>>;

    /// 批量删除（Quiet 模式），只返回失败项
    async fn delete_objects(&self, keys: &[String]) -> Result<Vec<DeleteFailure>>;

    /// 生成预签名URL
    fn presign(&self, method: &str, key: &str, query: &[(&str, &str)], expires: Duration) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct ListBucketResult {
    #[serde(rename = "Contents", default)]
    contents: Vec<ContentsXml>,
    #[serde(rename = "CommonPrefixes", default)]
    common_prefixes: Vec<PrefixXml>,
    #[serde(rename = "IsTruncated", default)]
    is_truncated: bool,
    #[serde(rename = "NextContinuationToken")]
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentsXml {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Size", default)]
    size: i64,
    #[serde(rename = "LastModified")]
    last_modified: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PrefixXml {
    #[serde(rename = "Prefix")]
    prefix: String,
}

#[derive(Debug, Deserialize)]
struct DeleteResultXml {
    #[serde(rename = "Error", default)]
    errors: Vec<DeleteErrorXml>,
}

#[derive(Debug, Deserialize)]
struct DeleteErrorXml {
    #[serde(rename = "Key", default)]
    key: String,
    #[serde(rename = "Code", default)]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct InitiateMultipartUploadXml {
    #[serde(rename = "UploadId")]
    upload_id: String,
}

#[derive(Debug, Deserialize)]
struct CopyObjectResultXml {
    #[serde(rename = "LastModified")]
    last_modified: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorXml {
    #[serde(rename = "Code", default)]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
}

fn parse_xml<'de, T: Deserialize<'de>>(xml: &'de str) -> Result<T> {
    quick_xml::de::from_str(xml).map_err(|e| DriveError::remote(200, format!("malformed response: {}", e)))
}

fn parse_time(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_rfc2822(value))
        .ok()
        .map(|t| t.with_timezone(&Utc).timestamp_millis())
}

fn xml_escape(s: &str) -> String {
    quick_xml::escape::escape(s).into_owned()
}

/// DeleteObjects 请求体
pub fn build_delete_body(keys: &[String]) -> String {
    let mut body = String::from("<Delete><Quiet>true</Quiet>");
    for key in keys {
        body.push_str(&format!("<Object><Key>{}</Key></Object>", xml_escape(key)));
    }
    body.push_str("</Delete>");
    body
}

/// CompleteMultipartUpload 请求体
pub fn build_complete_body(parts: &[CompletedPart]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for part in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number,
            xml_escape(&part.etag)
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

struct Signed {
    url: String,
    headers: BTreeMap<String, String>,
}

/// 按扩展名推断 Content-Type，目录占位对象用 application/x-directory
fn content_type(key: &str) -> String {
    if key.ends_with('/') {
        return "application/x-directory".to_string();
    }
    mime_guess::from_path(key).first_or_octet_stream().to_string()
}

/// 基于 reqwest 的 S3 客户端
pub struct S3Client {
    http: reqwest::Client,
    signer: SigV4Signer,
    scheme: String,
    /// host[:port]
    authority: String,
    bucket: String,
    path_style: bool,
}

impl S3Client {
    pub fn new(config: &S3Config) -> Result<Self> {
        config.validate()?;
        let endpoint = url::Url::parse(&config.endpoint_url())
            .map_err(|e| DriveError::Config(format!("invalid endpoint: {}", e)))?;
        let host = endpoint
            .host_str()
            .ok_or_else(|| DriveError::Config("endpoint has no host".into()))?;
        let authority = match endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let session_token = if config.session_token.is_empty() {
            None
        } else {
            Some(config.session_token.clone())
        };
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            signer: SigV4Signer::new(
                Credentials {
                    access_key_id: config.access_key_id.clone(),
                    secret_access_key: config.secret_access_key.clone(),
                    session_token,
                },
                &config.region,
            ),
            scheme: endpoint.scheme().to_string(),
            authority,
            bucket: config.bucket.clone(),
            path_style: config.force_path_style,
        })
    }

    /// (host, 已编码路径)
    fn locate(&self, key: &str) -> (String, String) {
        let key = uri_encode(key, false);
        if self.path_style {
            (self.authority.clone(), format!("/{}/{}", self.bucket, key))
        } else {
            (format!("{}.{}", self.bucket, self.authority), format!("/{}", key))
        }
    }

    fn sign(
        &self,
        method: &Method,
        key: &str,
        query: &[(String, String)],
        extra_headers: &[(&str, String)],
        payload_hash: &str,
    ) -> Signed {
        let now = Utc::now();
        let (host, path) = self.locate(key);
        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), host.clone());
        headers.insert("x-amz-date".to_string(), now.format("%Y%m%dT%H%M%SZ").to_string());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());
        if let Some(token) = self.signer.session_token() {
            headers.insert("x-amz-security-token".to_string(), token.to_string());
        }
        for (name, value) in extra_headers {
            headers.insert(name.to_ascii_lowercase(), value.clone());
        }
        let authorization = self
            .signer
            .authorization(method.as_str(), &path, query, &headers, payload_hash, now);
        headers.insert("authorization".to_string(), authorization);
        headers.remove("host");

        let query_string = canonical_query_string(query);
        let url = if query_string.is_empty() {
            format!("{}://{}{}", self.scheme, host, path)
        } else {
            format!("{}://{}{}?{}", self.scheme, host, path, query_string)
        };
        Signed { url, headers }
    }

    async fn send(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, &str)],
        extra_headers: &[(&str, String)],
        body: Bytes,
    ) -> Result<reqwest::Response> {
        let query: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let payload_hash = sha256_hex(&body);
        let signed = self.sign(&method, key, &query, extra_headers, &payload_hash);
        tracing::debug!("S3 {} {}", method, signed.url);

        let mut request = self.http.request(method, &signed.url);
        for (name, value) in &signed.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.body(body).send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(Self::error_from(key, response).await)
    }

    async fn error_from(key: &str, response: reqwest::Response) -> DriveError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let parsed: Option<ErrorXml> = quick_xml::de::from_str(&text).ok();
        let (code, message) = parsed
            .map(|e| (e.code, e.message))
            .unwrap_or_else(|| (String::new(), text.clone()));
        match status {
            StatusCode::NOT_FOUND => DriveError::not_found(key),
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                DriveError::Unauthorized(format!("{} {}", code, message).trim().to_string())
            }
            _ => DriveError::remote(status.as_u16(), format!("{} {}", code, message).trim().to_string()),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn head_bucket(&self) -> Result<()> {
        match self.send(Method::HEAD, "", &[], &[], Bytes::new()).await {
            Ok(_) => Ok(()),
            Err(DriveError::NotFound(_)) => {
                Err(DriveError::not_found(format!("bucket {} does not exist", self.bucket)))
            }
            Err(e) => Err(e),
        }
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMeta> {
        let response = self.send(Method::HEAD, key, &[], &[], Bytes::new()).await?;
        let headers = response.headers();
        let size = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let last_modified = headers
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_time);
        Ok(ObjectMeta {
            key: key.to_string(),
            size,
            last_modified,
        })
    }

    async fn list_objects(&self, prefix: &str, delimiter: Option<&str>) -> Result<ListResult> {
        let mut result = ListResult::default();
        let mut token: Option<String> = None;
        loop {
            let mut query: Vec<(&str, &str)> = vec![("list-type", "2"), ("prefix", prefix)];
            if let Some(d) = delimiter {
                query.push(("delimiter", d));
            }
            if let Some(t) = token.as_deref() {
                query.push(("continuation-token", t));
            }
            let text = self
                .send(Method::GET, "", &query, &[], Bytes::new())
                .await?
                .text()
                .await?;
            let page: ListBucketResult = parse_xml(&text)?;
            result.objects.extend(page.contents.into_iter().map(|c| ObjectMeta {
                key: c.key,
                size: c.size,
                last_modified: c.last_modified.as_deref().and_then(parse_time),
            }));
            result
                .common_prefixes
                .extend(page.common_prefixes.into_iter().map(|p| p.prefix));
            match page.next_continuation_token {
                Some(next) if page.is_truncated => token = Some(next),
                _ => break,
            }
        }
        Ok(result)
    }

    async fn get_object(&self, key: &str) -> Result<BoxReader> {
        let response = self.send(Method::GET, key, &[], &[], Bytes::new()).await?;
        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    async fn put_object(&self, key: &str, body: Bytes) -> Result<()> {
        self.send(Method::PUT, key, &[], &[("content-type", content_type(key))], body)
            .await?;
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        let text = self
            .send(
                Method::POST,
                key,
                &[("uploads", "")],
                &[("content-type", content_type(key))],
                Bytes::new(),
            )
            .await?
            .text()
            .await?;
        let result: InitiateMultipartUploadXml = parse_xml(&text)?;
        Ok(result.upload_id)
    }

    async fn upload_part(&self, key: &str, upload_id: &str, part_number: i64, body: Bytes) -> Result<String> {
        let part = part_number.to_string();
        let response = self
            .send(
                Method::PUT,
                key,
                &[("partNumber", part.as_str()), ("uploadId", upload_id)],
                &[],
                body,
            )
            .await?;
        response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| DriveError::remote(200, "upload part response has no ETag"))
    }

    async fn complete_multipart_upload(&self, key: &str, upload_id: &str, parts: &[CompletedPart]) -> Result<()> {
        let body = build_complete_body(parts);
        let text = self
            .send(Method::POST, key, &[("uploadId", upload_id)], &[], Bytes::from(body))
            .await?
            .text()
            .await?;
        // 200 响应体中也可能携带错误
        if let Ok(e) = quick_xml::de::from_str::<ErrorXml>(&text) {
            if !e.code.is_empty() {
                return Err(DriveError::remote(200, format!("{} {}", e.code, e.message)));
            }
        }
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.send(Method::DELETE, key, &[("uploadId", upload_id)], &[], Bytes::new())
            .await?;
        Ok(())
    }

    async fn copy_object(&self, from_key: &str, to_key: &str) -> Result<Option<i64>> {
        let source = uri_encode(&format!("{}/{}", self.bucket, from_key), false);
        let text = self
            .send(Method::PUT, to_key, &[], &[("x-amz-copy-source", source)], Bytes::new())
            .await?
            .text()
            .await?;
        if let Ok(e) = quick_xml::de::from_str::<ErrorXml>(&text) {
            if !e.code.is_empty() {
                return Err(DriveError::remote(200, format!("{} {}", e.code, e.message)));
            }
        }
        let result: CopyObjectResultXml = parse_xml(&text)?;
        Ok(result.last_modified.as_deref().and_then(parse_time))
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<Vec<DeleteFailure>> {
        let body = build_delete_body(keys);
        let md5 = base64::engine::general_purpose::STANDARD.encode(md5::compute(body.as_bytes()).0);
        let text = self
            .send(Method::POST, "", &[("delete", "")], &[("content-md5", md5)], Bytes::from(body))
            .await?
            .text()
            .await?;
        let result: DeleteResultXml = parse_xml(&text)?;
        Ok(result
            .errors
            .into_iter()
            .map(|e| DeleteFailure {
                key: e.key,
                code: e.code,
                message: e.message,
            })
            .collect())
    }

    fn presign(&self, method: &str, key: &str, query: &[(&str, &str)], expires: Duration) -> Result<String> {
        let (host, path) = self.locate(key);
        let query: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let signed_query = self
            .signer
            .presign_query(method, &host, &path, &query, expires.as_secs(), Utc::now());
        Ok(format!("{}://{}{}?{}", self.scheme, host, path, signed_query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(path_style: bool) -> S3Client {
        S3Client::new(&S3Config {
            bucket: "bkt".into(),
            endpoint: "http://localhost:9000".into(),
            access_key_id: "ak".into(),
            secret_access_key: "sk".into(),
            force_path_style: path_style,
            ..S3Config::default()
        })
        .unwrap()
    }

    #[test]
    fn test_locate() {
        assert_eq!(
            client(true).locate("a b/c.txt"),
            ("localhost:9000".to_string(), "/bkt/a%20b/c.txt".to_string())
        );
        assert_eq!(
            client(false).locate("x"),
            ("bkt.localhost:9000".to_string(), "/x".to_string())
        );
    }

    #[test]
    fn test_presign_part_url() {
        let url = client(true)
            .presign("PUT", "a/b.bin", &[("partNumber", "3"), ("uploadId", "u-1")], Duration::from_secs(7200))
            .unwrap();
        assert!(url.starts_with("http://localhost:9000/bkt/a/b.bin?"));
        assert!(url.contains("partNumber=3"));
        assert!(url.contains("uploadId=u-1"));
        assert!(url.contains("X-Amz-Expires=7200"));
        assert!(url.contains("X-Amz-Signature="));
    }

    #[test]
    fn test_request_bodies() {
        let body = build_delete_body(&["a&b".to_string(), "d/".to_string()]);
        assert_eq!(
            body,
            "<Delete><Quiet>true</Quiet><Object><Key>a&amp;b</Key></Object><Object><Key>d/</Key></Object></Delete>"
        );
        let body = build_complete_body(&[
            CompletedPart { part_number: 1, etag: "\"e1\"".into() },
            CompletedPart { part_number: 2, etag: "\"e2\"".into() },
        ]);
        assert!(body.contains("<Part><PartNumber>1</PartNumber><ETag>&quot;e1&quot;</ETag></Part><Part><PartNumber>2</PartNumber>"));
    }

    #[test]
    fn test_parse_list() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>bkt</Name><Prefix>d/</Prefix><KeyCount>2</KeyCount><IsTruncated>false</IsTruncated>
  <Contents><Key>d/a.txt</Key><LastModified>2009-10-12T17:50:30.000Z</LastModified><ETag>"x"</ETag><Size>434234</Size><StorageClass>STANDARD</StorageClass></Contents>
  <CommonPrefixes><Prefix>d/sub/</Prefix></CommonPrefixes>
</ListBucketResult>"#;
        let page: ListBucketResult = parse_xml(xml).unwrap();
        assert_eq!(page.contents.len(), 1);
        assert_eq!(page.contents[0].key, "d/a.txt");
        assert_eq!(page.contents[0].size, 434234);
        assert_eq!(
            page.contents[0].last_modified.as_deref().and_then(parse_time),
            Some(1255369830000)
        );
        assert_eq!(page.common_prefixes[0].prefix, "d/sub/");
        assert!(!page.is_truncated);
    }

    #[test]
    fn test_parse_delete_errors() {
        let xml = r#"<DeleteResult><Error><Key>k1</Key><Code>AccessDenied</Code><Message>denied</Message></Error></DeleteResult>"#;
        let result: DeleteResultXml = parse_xml(xml).unwrap();
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].key, "k1");
        assert_eq!(result.errors[0].code, "AccessDenied");
        let empty: DeleteResultXml = parse_xml("<DeleteResult></DeleteResult>").unwrap();
        assert!(empty.errors.is_empty());
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("Mon, 12 Oct 2009 17:50:00 GMT"), Some(1255369800000));
        assert_eq!(parse_time("nope"), None);
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type("a/b.txt"), "text/plain");
        assert_eq!(content_type("a/b"), "application/octet-stream");
        assert_eq!(content_type("a/"), "application/x-directory");
    }
}
