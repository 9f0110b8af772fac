use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use tokio::sync::mpsc;

use super::{
    CompletedPart, ObjectData, ObjectHead, ObjectStore, ObjectTail, StoreError,
    WriteCondition,
};
use crate::config::StoreConfig;
use crate::range::OffsetLength;

/// Granularité des trames du corps d'une partie, donc des notifications de progression.
const BODY_CHUNK: usize = 64 * 1024;

/// Client S3 (Storj DCS, MinIO, AWS…) derrière le trait [`ObjectStore`].
pub struct S3Store {
    s3_client: S3Client,
}

impl S3Store {
    /// Crée un client à partir d'une configuration (identifiants statiques, path-style).
    pub fn new(config: &StoreConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "cinevault",
        );

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .endpoint_url(&config.endpoint)
            .force_path_style(true) // la plupart des passerelles compatibles exigent le path-style
            // Les reprises passent par `transfer::retry` pour que chaque tentative soit comptée.
            .retry_config(RetryConfig::disabled())
            .build();

        log::info!(
            "S3Store::new: endpoint={}, region={}",
            config.endpoint,
            config.region
        );
        Self {
            s3_client: S3Client::from_conf(s3_config),
        }
    }

    /// Identifiants issus de la chaîne par défaut (variables d'environnement, profils).
    pub async fn from_environment(config: &StoreConfig) -> Self {
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(&config.endpoint)
            .retry_config(RetryConfig::disabled())
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();

        log::info!(
            "S3Store::from_environment: endpoint={}, region={}",
            config.endpoint,
            config.region
        );
        Self {
            s3_client: S3Client::from_conf(s3_config),
        }
    }

    pub fn from_client(s3_client: S3Client) -> Self {
        Self { s3_client }
    }
}

/// Classe une erreur SDK : absence, précondition, transitoire ou fatale.
fn classify<E>(operation: &str, err: SdkError<E>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|response| response.status().as_u16());
    let code = err.code().map(str::to_owned);
    let detail = format!("{operation}: {}", DisplayErrorContext(&err));

    let classified = match (status, code.as_deref()) {
        (Some(404), _) | (_, Some("NoSuchKey" | "NotFound")) => StoreError::NotFound,
        (Some(412), _) | (_, Some("PreconditionFailed" | "ConditionalRequestConflict")) => {
            StoreError::PreconditionFailed
        }
        (Some(429), _) | (Some(500..=599), _) => StoreError::Transient(detail),
        (_, Some("SlowDown" | "RequestTimeout" | "InternalError" | "ServiceUnavailable")) => {
            StoreError::Transient(detail)
        }
        _ => match err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
                StoreError::Transient(detail)
            }
            _ => StoreError::Fatal(detail),
        },
    };
    if !matches!(classified, StoreError::NotFound) {
        log::error!(
            "S3Store::{} failed: status={:?}, code={:?}, error={}",
            operation,
            status,
            code,
            classified
        );
    }
    classified
}

fn parse_total_len(content_range: &str) -> Option<u64> {
    content_range.rsplit('/').next()?.trim().parse().ok()
}

async fn collect_body(operation: &str, body: ByteStream) -> Result<Vec<u8>, StoreError> {
    body.collect()
        .await
        .map(|data| data.into_bytes().to_vec())
        .map_err(|e| StoreError::Transient(format!("{operation}: failed to read response body: {e}")))
}

/// Corps de partie qui signale chaque trame au moment où le SDK la consomme.
struct CountingBody {
    remaining: Bytes,
    sent: mpsc::UnboundedSender<u64>,
}

impl Body for CountingBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if self.remaining.is_empty() {
            return Poll::Ready(None);
        }
        let take = self.remaining.len().min(BODY_CHUNK);
        let chunk = self.remaining.split_to(take);
        // Récepteur fermé : l'appel a déjà rendu la main, plus personne n'écoute.
        let _ = self.sent.send(chunk.len() as u64);
        Poll::Ready(Some(Ok(Frame::data(chunk))))
    }

    fn is_end_stream(&self) -> bool {
        self.remaining.is_empty()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.remaining.len() as u64)
    }
}

/// Envoie `data` via `send` en relayant la progression trame par trame.
///
/// Les octets consommés sont signalés même si la requête échoue ensuite,
/// ce qui permet à l'appelant de les annuler.
async fn send_counted<T, F, Fut>(
    data: Vec<u8>,
    progress: &(dyn Fn(u64) + Send + Sync),
    send: F,
) -> T
where
    F: FnOnce(ByteStream) -> Fut,
    Fut: Future<Output = T>,
{
    let (sent_tx, mut sent_rx) = mpsc::unbounded_channel();
    let body = ByteStream::from_body_1_x(CountingBody {
        remaining: Bytes::from(data),
        sent: sent_tx,
    });
    let send = send(body);
    tokio::pin!(send);
    let result = loop {
        tokio::select! {
            biased;
            Some(bytes) = sent_rx.recv() => progress(bytes),
            result = &mut send => break result,
        }
    };
    while let Ok(bytes) = sent_rx.try_recv() {
        progress(bytes);
    }
    result
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectHead>, StoreError> {
        let result = self
            .s3_client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await;
        match result {
            Ok(output) => {
                let e_tag = output
                    .e_tag()
                    .ok_or_else(|| StoreError::Fatal("head_object: no ETag returned".to_string()))?
                    .to_string();
                let size = output.content_length().unwrap_or_default().max(0) as u64;
                Ok(Some(ObjectHead { e_tag, size }))
            }
            Err(err) => match classify("head_object", err) {
                StoreError::NotFound => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectData, StoreError> {
        let output = self
            .s3_client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("get_object", e))?;
        let e_tag = output
            .e_tag()
            .ok_or_else(|| StoreError::Fatal("get_object: no ETag returned".to_string()))?
            .to_string();
        let data = collect_body("get_object", output.body).await?;
        log::info!(
            "S3Store::get: bucket={}, key={}, data_len={}, etag={}",
            bucket,
            key,
            data.len(),
            e_tag
        );
        Ok(ObjectData { data, e_tag })
    }

    async fn get_range(&self, bucket: &str, key: &str, range: OffsetLength) -> Result<Vec<u8>, StoreError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let output = self
            .s3_client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(range.http_range())
            .send()
            .await
            .map_err(|e| classify("get_object(range)", e))?;
        let data = collect_body("get_object(range)", output.body).await?;
        if data.len() != range.length as usize {
            return Err(StoreError::Fatal(format!(
                "get_object(range): asked {} bytes at {}, got {}",
                range.length,
                range.offset,
                data.len()
            )));
        }
        Ok(data)
    }

    async fn get_tail(&self, bucket: &str, key: &str, len: u64) -> Result<ObjectTail, StoreError> {
        let output = self
            .s3_client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(format!("bytes=-{len}"))
            .send()
            .await
            .map_err(|e| classify("get_object(tail)", e))?;
        let total = output.content_range().and_then(parse_total_len);
        let data = collect_body("get_object(tail)", output.body).await?;
        // Sans Content-Range, le serveur a renvoyé l'objet entier.
        let object_len = total.unwrap_or(data.len() as u64);
        if (data.len() as u64) > object_len {
            return Err(StoreError::Fatal(format!(
                "get_object(tail): {} bytes returned for an object of {}",
                data.len(),
                object_len
            )));
        }
        Ok(ObjectTail { data, object_len })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        condition: WriteCondition,
    ) -> Result<String, StoreError> {
        log::info!(
            "S3Store::put: bucket={}, key={}, data_len={}, condition={:?}",
            bucket,
            key,
            data.len(),
            condition
        );
        let mut request = self
            .s3_client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data));
        request = match condition {
            WriteCondition::None => request,
            WriteCondition::IfMatch(e_tag) => request.if_match(e_tag),
            WriteCondition::IfAbsent => request.if_none_match("*"),
        };
        let output = request.send().await.map_err(|e| classify("put_object", e))?;
        let e_tag = output
            .e_tag()
            .ok_or_else(|| StoreError::Fatal("put_object: no ETag returned".to_string()))?
            .to_string();
        log::info!("S3Store::put success: etag={}", e_tag);
        Ok(e_tag)
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String, StoreError> {
        let output = self
            .s3_client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("create_multipart_upload", e))?;
        let upload_id = output
            .upload_id()
            .ok_or_else(|| StoreError::Fatal("create_multipart_upload: no upload id returned".to_string()))?
            .to_string();
        log::info!(
            "S3Store::create_multipart_upload: bucket={}, key={}, upload_id={}",
            bucket,
            key,
            upload_id
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
        progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<String, StoreError> {
        let request = self
            .s3_client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_length(data.len() as i64);
        let output = send_counted(data, progress, |body| request.body(body).send())
            .await
            .map_err(|e| classify("upload_part", e))?;
        let e_tag = output
            .e_tag()
            .ok_or_else(|| StoreError::Fatal("upload_part: no ETag returned".to_string()))?
            .to_string();
        Ok(e_tag)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
        condition: WriteCondition,
    ) -> Result<String, StoreError> {
        let parts = parts
            .into_iter()
            .map(|part| {
                S3CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(part.e_tag)
                    .build()
            })
            .collect::<Vec<_>>();
        let part_count = parts.len();
        let upload = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();

        let mut request = self
            .s3_client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(upload);
        request = match condition {
            WriteCondition::None => request,
            WriteCondition::IfMatch(e_tag) => request.if_match(e_tag),
            WriteCondition::IfAbsent => request.if_none_match("*"),
        };
        let output = request
            .send()
            .await
            .map_err(|e| classify("complete_multipart_upload", e))?;
        let e_tag = output
            .e_tag()
            .ok_or_else(|| StoreError::Fatal("complete_multipart_upload: no ETag returned".to_string()))?
            .to_string();
        log::info!(
            "S3Store::complete_multipart_upload: key={}, parts={}, etag={}",
            key,
            part_count,
            e_tag
        );
        Ok(e_tag)
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<(), StoreError> {
        self.s3_client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify("abort_multipart_upload", e))?;
        log::warn!(
            "S3Store::abort_multipart_upload: key={}, upload_id={}",
            key,
            upload_id
        );
        Ok(())
    }
}
