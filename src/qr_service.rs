use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rearch::CapsuleHandle;
use serde::Serialize;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::{
    config::base_url_capsule,
    qr_encoder::{
        EncodedImage, InvalidColorError, QrColor, QrFormat, QrImageEncoder, QrStyle,
        UnknownFormatError, qr_encoder_capsule,
    },
    qr_repo::{
        DestinationUrl, InsertRecordError, InvalidDestinationError, NewQrRecord, QrRecord,
        QrRecordChanges, QrRepository, UpdateRecordError, qr_repository_capsule,
    },
    short_id::{SHORT_ID_LENGTH, ShortId, ShortIdGenerator, short_id_generator_capsule},
};

/// Short ID draws attempted per creation before giving up.
pub const MAX_ALLOCATION_ATTEMPTS: usize = 5;

/// Client-supplied fields; empty strings count as absent.
#[derive(Clone, Debug, Default)]
pub struct QrFields {
    pub destination_url: Option<String>,
    pub color: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug)]
pub struct RenderedQr {
    pub short_id: String,
    pub redirect_url: String,
    pub original_url: String,
    pub image: EncodedImage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrRecordView {
    pub short_id: String,
    pub original_url: String,
    pub redirect_url: String,
    pub color: String,
    pub format: QrFormat,
    /// Timestamp in ISO-8601 format
    pub created_at: String,
    /// Timestamp in ISO-8601 format
    pub updated_at: String,
}

#[derive(Debug)]
pub struct UpdatedQr {
    pub short_id: String,
    pub redirect_url: String,
}

#[derive(Debug)]
pub struct Redirect {
    pub url: String,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("destination_url is required")]
    MissingDestination,
    #[error("invalid destination_url: {0}")]
    InvalidUrl(#[from] InvalidDestinationError),
    #[error(transparent)]
    InvalidColor(#[from] InvalidColorError),
    #[error(transparent)]
    InvalidFormat(#[from] UnknownFormatError),
    #[error("no fields to update")]
    NoFieldsToUpdate,
}

#[derive(Debug, Error)]
pub enum QrServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("QR code not found")]
    NotFound,
    #[error("could not allocate a unique short ID after {attempts} attempts")]
    AllocationExhausted { attempts: usize },
    #[error("internal/database error: {0}")]
    Storage(anyhow::Error), // NOTE: no #[from] so we have to be explicit
    #[error("failed to render QR image: {0}")]
    Encoding(anyhow::Error),
}

pub fn qr_record_service_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn QrRecordService> {
    let repo = Arc::clone(get.as_ref(qr_repository_capsule));
    let id_generator = Arc::clone(get.as_ref(short_id_generator_capsule));
    let encoder = Arc::clone(get.as_ref(qr_encoder_capsule));
    let base_url = get.as_ref(base_url_capsule).clone();
    Arc::new(QrRecordServiceImpl::new(
        repo,
        id_generator,
        encoder,
        &base_url,
    ))
}

#[async_trait]
pub trait QrRecordService: Send + Sync {
    /// Creates a record under a freshly allocated short ID, or updates `existing_short_id`,
    /// then renders an image whose payload is the record's redirect URL.
    ///
    /// The record stays persisted even when rendering fails afterwards.
    async fn create_or_update(
        &self,
        fields: QrFields,
        existing_short_id: Option<&str>,
    ) -> Result<RenderedQr, QrServiceError>;

    /// Overwrites only the supplied fields; at least one must be present.
    async fn update(&self, short_id: &str, fields: QrFields) -> Result<UpdatedQr, QrServiceError>;

    async fn lookup(&self, short_id: &str) -> Result<QrRecordView, QrServiceError>;

    async fn redirect(&self, short_id: &str) -> Result<Redirect, QrServiceError>;

    /// Renders a stored record again with its current color and format.
    async fn render(&self, short_id: &str) -> Result<RenderedQr, QrServiceError>;

    /// Renders `destination_url` directly without persisting anything.
    async fn render_static(&self, fields: QrFields) -> Result<EncodedImage, QrServiceError>;

    async fn check_store(&self) -> Result<(), QrServiceError>;
}

pub struct QrRecordServiceImpl {
    repo: Arc<dyn QrRepository>,
    id_generator: Arc<dyn ShortIdGenerator>,
    encoder: Arc<dyn QrImageEncoder>,
    /// Without trailing slash
    base_url: String,
    max_allocation_attempts: usize,
}

impl QrRecordServiceImpl {
    #[must_use]
    pub fn new(
        repo: Arc<dyn QrRepository>,
        id_generator: Arc<dyn ShortIdGenerator>,
        encoder: Arc<dyn QrImageEncoder>,
        base_url: &Url,
    ) -> Self {
        Self {
            repo,
            id_generator,
            encoder,
            base_url: base_url.as_str().trim_end_matches('/').to_owned(),
            max_allocation_attempts: MAX_ALLOCATION_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_max_allocation_attempts(mut self, attempts: usize) -> Self {
        self.max_allocation_attempts = attempts;
        self
    }

    fn redirect_url(&self, short_id: &ShortId) -> String {
        format!("{}/redirect/{short_id}", self.base_url)
    }

    /// Draws short IDs until one inserts cleanly; collisions are expected and absorbed.
    async fn insert_with_fresh_id(
        &self,
        original_url: DestinationUrl,
        color: QrColor,
        format: QrFormat,
    ) -> Result<QrRecord, QrServiceError> {
        for attempt in 1..=self.max_allocation_attempts {
            let candidate = self.id_generator.generate(SHORT_ID_LENGTH);
            let short_id = match ShortId::new(candidate) {
                Ok(short_id) => short_id,
                Err(err) => {
                    // NOTE: only a buggy generator gets here, but it still costs an attempt
                    warn!(attempt, ?err, "Generated invalid ShortId");
                    continue;
                }
            };

            let to_insert = NewQrRecord {
                short_id: short_id.clone(),
                original_url: original_url.clone(),
                color: color.clone(),
                format,
            };
            match self.repo.insert_record(to_insert).await {
                Ok(record) => return Ok(record),
                Err(InsertRecordError::ShortIdTaken) => {
                    debug!(attempt, %short_id, "Generated ShortId that was already taken");
                }
                Err(InsertRecordError::Internal(err)) => return Err(QrServiceError::Storage(err)),
            }
        }

        Err(QrServiceError::AllocationExhausted {
            attempts: self.max_allocation_attempts,
        })
    }

    async fn update_existing(
        &self,
        short_id: &str,
        changes: QrRecordChanges,
    ) -> Result<QrRecord, QrServiceError> {
        let short_id = parse_existing_short_id(short_id)?;
        self.repo
            .update_record(&short_id, changes)
            .await
            .map_err(|err| match err {
                UpdateRecordError::NotFound => QrServiceError::NotFound,
                UpdateRecordError::Internal(err) => QrServiceError::Storage(err),
            })
    }

    async fn find_existing(&self, short_id: &str) -> Result<QrRecord, QrServiceError> {
        let short_id = parse_existing_short_id(short_id)?;
        self.repo
            .find_record(&short_id)
            .await
            .map_err(QrServiceError::Storage)?
            .ok_or(QrServiceError::NotFound)
    }

    async fn encode(
        &self,
        payload: String,
        color: QrColor,
        format: QrFormat,
    ) -> Result<EncodedImage, QrServiceError> {
        let encoder = Arc::clone(&self.encoder);
        tokio::task::spawn_blocking(move || {
            encoder.encode(&payload, &QrStyle::with_dark(color), format)
        })
        .await
        .context("QR encoder task did not complete")
        .map_err(QrServiceError::Encoding)?
        .map_err(|err| QrServiceError::Encoding(err.into()))
    }

    async fn render_record(&self, record: QrRecord) -> Result<RenderedQr, QrServiceError> {
        let redirect_url = self.redirect_url(&record.short_id);
        let image = self
            .encode(redirect_url.clone(), record.color, record.format)
            .await?;
        Ok(RenderedQr {
            short_id: record.short_id.into_inner(),
            redirect_url,
            original_url: record.original_url.into_inner(),
            image,
        })
    }
}

#[async_trait]
impl QrRecordService for QrRecordServiceImpl {
    #[instrument(skip(self))]
    async fn create_or_update(
        &self,
        fields: QrFields,
        existing_short_id: Option<&str>,
    ) -> Result<RenderedQr, QrServiceError> {
        let changes = parse_fields(fields)?;
        let Some(original_url) = changes.original_url.clone() else {
            return Err(ValidationError::MissingDestination.into());
        };

        let record = match existing_short_id {
            Some(short_id) => self.update_existing(short_id, changes).await?,
            None => {
                self.insert_with_fresh_id(
                    original_url,
                    changes.color.unwrap_or_default(),
                    changes.format.unwrap_or_default(),
                )
                .await?
            }
        };

        self.render_record(record).await
    }

    #[instrument(skip(self))]
    async fn update(&self, short_id: &str, fields: QrFields) -> Result<UpdatedQr, QrServiceError> {
        let changes = parse_fields(fields)?;
        if changes.is_empty() {
            return Err(ValidationError::NoFieldsToUpdate.into());
        }

        let record = self.update_existing(short_id, changes).await?;
        Ok(UpdatedQr {
            redirect_url: self.redirect_url(&record.short_id),
            short_id: record.short_id.into_inner(),
        })
    }

    #[instrument(skip(self))]
    async fn lookup(&self, short_id: &str) -> Result<QrRecordView, QrServiceError> {
        let record = self.find_existing(short_id).await?;
        let redirect_url = self.redirect_url(&record.short_id);
        QrRecordView::from_record(record, redirect_url).map_err(QrServiceError::Storage)
    }

    #[instrument(skip(self))]
    async fn redirect(&self, short_id: &str) -> Result<Redirect, QrServiceError> {
        let record = self.find_existing(short_id).await?;
        Ok(Redirect {
            url: record.original_url.into_inner(),
        })
    }

    #[instrument(skip(self))]
    async fn render(&self, short_id: &str) -> Result<RenderedQr, QrServiceError> {
        let record = self.find_existing(short_id).await?;
        self.render_record(record).await
    }

    #[instrument(skip(self))]
    async fn render_static(&self, fields: QrFields) -> Result<EncodedImage, QrServiceError> {
        let changes = parse_fields(fields)?;
        let original_url = changes
            .original_url
            .ok_or(ValidationError::MissingDestination)?;
        self.encode(
            original_url.into_inner(),
            changes.color.unwrap_or_default(),
            changes.format.unwrap_or_default(),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn check_store(&self) -> Result<(), QrServiceError> {
        self.repo.ping().await.map_err(QrServiceError::Storage)
    }
}

impl QrRecordView {
    fn from_record(
        QrRecord {
            short_id,
            original_url,
            color,
            format,
            created_at,
            updated_at,
        }: QrRecord,
        redirect_url: String,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            short_id: short_id.into_inner(),
            original_url: original_url.into_inner(),
            redirect_url,
            color: color.as_str().to_owned(),
            format,
            created_at: created_at
                .format(&Rfc3339)
                .context("Failed to format creation timestamp")?,
            updated_at: updated_at
                .format(&Rfc3339)
                .context("Failed to format update timestamp")?,
        })
    }
}

fn parse_fields(
    QrFields {
        destination_url,
        color,
        format,
    }: QrFields,
) -> Result<QrRecordChanges, ValidationError> {
    fn supplied(field: Option<String>) -> Option<String> {
        field.filter(|value| !value.trim().is_empty())
    }

    Ok(QrRecordChanges {
        original_url: supplied(destination_url)
            .map(|url| DestinationUrl::parse(&url))
            .transpose()?,
        color: supplied(color)
            .map(|color| color.parse::<QrColor>())
            .transpose()?,
        format: supplied(format)
            .map(|format| format.parse::<QrFormat>())
            .transpose()?,
    })
}

/// A malformed ID can never have been issued, so it is reported as missing.
fn parse_existing_short_id(short_id: &str) -> Result<ShortId, QrServiceError> {
    ShortId::new(short_id.to_owned()).map_err(|err| {
        debug!(short_id, ?err, "Rejecting malformed ShortId");
        QrServiceError::NotFound
    })
}
