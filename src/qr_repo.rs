use std::{fmt, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use rearch::CapsuleHandle;
use sea_orm::{
    ActiveModelTrait,
    ActiveValue::{NotSet, Set, Unchanged},
    DbConn, DbErr, EntityTrait, SqlErr,
};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::instrument;
use url::Url;

use crate::{
    config::db_conn_capsule,
    orm::qr_code,
    qr_encoder::{QrColor, QrFormat},
    short_id::ShortId,
};

pub fn qr_repository_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn QrRepository> {
    let db = get.as_ref(db_conn_capsule).clone();
    Arc::new(QrRepositoryImpl { db })
}

/// A redirect destination, kept verbatim as submitted once it parses as an absolute URL.
///
/// The text always fits in a `Location` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestinationUrl(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidDestinationError {
    #[error(transparent)]
    Parse(#[from] url::ParseError),
    #[error("must not contain control characters")]
    ControlCharacter,
}

impl DestinationUrl {
    /// # Errors
    /// Will return [`Err`] if `url` is not an absolute URL or contains control characters.
    pub fn parse(url: &str) -> Result<Self, InvalidDestinationError> {
        let url = url.trim();
        // Url::parse silently drops tabs and newlines, the stored text would keep them
        if url.chars().any(char::is_control) {
            return Err(InvalidDestinationError::ControlCharacter);
        }
        Url::parse(url)?;
        Ok(Self(url.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for DestinationUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QrRecord {
    pub short_id: ShortId,
    pub original_url: DestinationUrl,
    pub color: QrColor,
    pub format: QrFormat,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewQrRecord {
    pub short_id: ShortId,
    pub original_url: DestinationUrl,
    pub color: QrColor,
    pub format: QrFormat,
}

impl NewQrRecord {
    #[must_use]
    pub fn into_record(self, now: OffsetDateTime) -> QrRecord {
        QrRecord {
            short_id: self.short_id,
            original_url: self.original_url,
            color: self.color,
            format: self.format,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Fields to overwrite on an existing record; `None` keeps the stored value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QrRecordChanges {
    pub original_url: Option<DestinationUrl>,
    pub color: Option<QrColor>,
    pub format: Option<QrFormat>,
}

impl QrRecordChanges {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.original_url.is_none() && self.color.is_none() && self.format.is_none()
    }

    pub fn apply_to(self, record: &mut QrRecord, now: OffsetDateTime) {
        if let Some(original_url) = self.original_url {
            record.original_url = original_url;
        }
        if let Some(color) = self.color {
            record.color = color;
        }
        if let Some(format) = self.format {
            record.format = format;
        }
        record.updated_at = now;
    }
}

#[derive(Debug, Error)]
pub enum InsertRecordError {
    #[error("short ID is already taken")]
    ShortIdTaken,
    #[error("internal/database error: {0}")]
    Internal(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum UpdateRecordError {
    #[error("no record exists for that short ID")]
    NotFound,
    #[error("internal/database error: {0}")]
    Internal(anyhow::Error),
}

#[async_trait]
pub trait QrRepository: Send + Sync {
    async fn find_record(&self, short_id: &ShortId) -> anyhow::Result<Option<QrRecord>>;

    /// Inserts a brand new record; never overwrites an existing one.
    async fn insert_record(&self, record: NewQrRecord) -> Result<QrRecord, InsertRecordError>;

    /// Overwrites the supplied fields of an existing record (last write wins).
    async fn update_record(
        &self,
        short_id: &ShortId,
        changes: QrRecordChanges,
    ) -> Result<QrRecord, UpdateRecordError>;

    async fn ping(&self) -> anyhow::Result<()>;
}

struct QrRepositoryImpl {
    db: DbConn,
}

#[async_trait]
impl QrRepository for QrRepositoryImpl {
    #[instrument(skip(self))]
    async fn find_record(&self, short_id: &ShortId) -> anyhow::Result<Option<QrRecord>> {
        qr_code::Entity::find_by_id(short_id.as_str())
            .one(&self.db)
            .await
            .context("Failed to query QR record")?
            .map(QrRecord::try_from)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn insert_record(&self, record: NewQrRecord) -> Result<QrRecord, InsertRecordError> {
        let now = OffsetDateTime::now_utc();
        let to_insert = qr_code::ActiveModel {
            short_id: Set(record.short_id.into_inner()),
            original_url: Set(record.original_url.into_inner()),
            color: Set(record.color.as_str().to_owned()),
            format: Set(record.format.as_str().to_owned()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match to_insert.insert(&self.db).await {
            Ok(model) => model.try_into().map_err(InsertRecordError::Internal),
            Err(err) => Err(insert_error(err.sql_err(), err)),
        }
    }

    #[instrument(skip(self))]
    async fn update_record(
        &self,
        short_id: &ShortId,
        changes: QrRecordChanges,
    ) -> Result<QrRecord, UpdateRecordError> {
        let to_update = qr_code::ActiveModel {
            short_id: Unchanged(short_id.as_str().to_owned()),
            original_url: changes
                .original_url
                .map_or(NotSet, |url| Set(url.into_inner())),
            color: changes
                .color
                .map_or(NotSet, |color| Set(color.as_str().to_owned())),
            format: changes
                .format
                .map_or(NotSet, |format| Set(format.as_str().to_owned())),
            created_at: NotSet,
            updated_at: Set(OffsetDateTime::now_utc()),
        };

        match to_update.update(&self.db).await {
            Ok(model) => model.try_into().map_err(UpdateRecordError::Internal),
            Err(DbErr::RecordNotUpdated) => Err(UpdateRecordError::NotFound),
            Err(err) => Err(UpdateRecordError::Internal(
                anyhow::Error::from(err).context("Failed to update QR record"),
            )),
        }
    }

    #[instrument(skip(self))]
    async fn ping(&self) -> anyhow::Result<()> {
        self.db.ping().await.context("Database ping failed")
    }
}

fn insert_error(sql_err: Option<SqlErr>, err: DbErr) -> InsertRecordError {
    match sql_err {
        Some(SqlErr::UniqueConstraintViolation(_)) => InsertRecordError::ShortIdTaken,
        _ => InsertRecordError::Internal(
            anyhow::Error::from(err).context("Failed to insert QR record"),
        ),
    }
}

impl TryFrom<qr_code::Model> for QrRecord {
    type Error = anyhow::Error;

    fn try_from(
        qr_code::Model {
            short_id,
            original_url,
            color,
            format,
            created_at,
            updated_at,
        }: qr_code::Model,
    ) -> Result<Self, Self::Error> {
        Ok(Self {
            short_id: ShortId::new(short_id).context("Stored short ID is invalid")?,
            original_url: DestinationUrl::parse(&original_url)
                .context("Stored destination URL is invalid")?,
            color: color.parse::<QrColor>().context("Stored color is invalid")?,
            format: format.parse::<QrFormat>().context("Stored format is invalid")?,
            created_at,
            updated_at,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use sea_orm::{DatabaseBackend, MockDatabase};

    use super::*;

    fn model(short_id: &str, original_url: &str) -> qr_code::Model {
        let now = OffsetDateTime::now_utc();
        qr_code::Model {
            short_id: short_id.to_owned(),
            original_url: original_url.to_owned(),
            color: "#000000".to_owned(),
            format: "png".to_owned(),
            created_at: now,
            updated_at: now,
        }
    }

    fn repo(db: MockDatabase) -> QrRepositoryImpl {
        QrRepositoryImpl {
            db: db.into_connection(),
        }
    }

    fn short_id(id: &str) -> ShortId {
        ShortId::new(id.to_owned()).unwrap()
    }

    #[test]
    fn test_destination_url_keeps_submitted_text() {
        let url = DestinationUrl::parse(" https://github.com ").unwrap();
        assert_eq!(url.as_str(), "https://github.com");
    }

    #[test]
    fn test_destination_url_rejects_relative_and_garbage() {
        assert_eq!(
            DestinationUrl::parse("/relative/path"),
            Err(InvalidDestinationError::Parse(
                url::ParseError::RelativeUrlWithoutBase
            ))
        );
        assert!(DestinationUrl::parse("not a url").is_err());
        assert!(DestinationUrl::parse("").is_err());
    }

    #[test]
    fn test_destination_url_rejects_control_characters() {
        for url in [
            "https://example.com/a\nb",
            "https://example.com/a\tb",
            "https://example.com/a\r\nLocation: https://evil.test",
            "https://example.com/\u{7f}",
        ] {
            assert_eq!(
                DestinationUrl::parse(url),
                Err(InvalidDestinationError::ControlCharacter),
                "{url:?}"
            );
        }
        assert!(DestinationUrl::parse("https://example.com/caf\u{e9}").is_ok());
    }

    #[test]
    fn test_insert_error_maps_unique_violation_to_taken() {
        // sqlx database errors cannot be built outside sqlx, so MockDatabase never yields one
        let taken = insert_error(
            Some(SqlErr::UniqueConstraintViolation(
                "duplicate key value violates unique constraint \"qr_codes_pkey\"".to_owned(),
            )),
            DbErr::Custom("duplicate key".to_owned()),
        );
        assert!(matches!(taken, InsertRecordError::ShortIdTaken));

        let foreign_key = insert_error(
            Some(SqlErr::ForeignKeyConstraintViolation("fk".to_owned())),
            DbErr::Custom("fk".to_owned()),
        );
        assert!(matches!(foreign_key, InsertRecordError::Internal(_)));

        let other = insert_error(None, DbErr::Custom("connection reset".to_owned()));
        assert!(matches!(other, InsertRecordError::Internal(_)));
    }

    #[test]
    fn test_changes_apply_only_supplied_fields() {
        let created = OffsetDateTime::now_utc();
        let mut record = NewQrRecord {
            short_id: short_id("abcDEF12"),
            original_url: DestinationUrl::parse("https://example.com").unwrap(),
            color: "#123456".parse().unwrap(),
            format: QrFormat::Svg,
        }
        .into_record(created);

        let later = created + time::Duration::seconds(5);
        QrRecordChanges {
            original_url: Some(DestinationUrl::parse("https://github.com").unwrap()),
            ..QrRecordChanges::default()
        }
        .apply_to(&mut record, later);

        assert_eq!(record.original_url.as_str(), "https://github.com");
        assert_eq!(record.color.as_str(), "#123456");
        assert_eq!(record.format, QrFormat::Svg);
        assert_eq!(record.created_at, created);
        assert_eq!(record.updated_at, later);
    }

    #[tokio::test]
    async fn test_find_record_found() {
        let stored = model("abcDEF12", "https://example.com");
        let repo = repo(
            MockDatabase::new(DatabaseBackend::Postgres).append_query_results([vec![stored]]),
        );

        let record = repo
            .find_record(&short_id("abcDEF12"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.short_id.as_str(), "abcDEF12");
        assert_eq!(record.original_url.as_str(), "https://example.com");
        assert_eq!(record.format, QrFormat::Png);
    }

    #[tokio::test]
    async fn test_find_record_missing() {
        let repo = repo(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([Vec::<qr_code::Model>::new()]),
        );
        assert!(
            repo.find_record(&short_id("abcDEF12"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_find_record_rejects_corrupt_row() {
        let mut stored = model("abcDEF12", "https://example.com");
        stored.format = "bmp".to_owned();
        let repo = repo(
            MockDatabase::new(DatabaseBackend::Postgres).append_query_results([vec![stored]]),
        );
        assert!(repo.find_record(&short_id("abcDEF12")).await.is_err());
    }

    #[tokio::test]
    async fn test_insert_record() {
        let stored = model("abcDEF12", "https://example.com");
        let repo = repo(
            MockDatabase::new(DatabaseBackend::Postgres).append_query_results([vec![stored]]),
        );

        let record = repo
            .insert_record(NewQrRecord {
                short_id: short_id("abcDEF12"),
                original_url: DestinationUrl::parse("https://example.com").unwrap(),
                color: QrColor::default(),
                format: QrFormat::Png,
            })
            .await
            .unwrap();
        assert_eq!(record.short_id.as_str(), "abcDEF12");
    }

    #[tokio::test]
    async fn test_insert_record_db_error() {
        let repo = repo(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_errors([DbErr::Custom("connection reset".to_owned())]),
        );

        let result = repo
            .insert_record(NewQrRecord {
                short_id: short_id("abcDEF12"),
                original_url: DestinationUrl::parse("https://example.com").unwrap(),
                color: QrColor::default(),
                format: QrFormat::Png,
            })
            .await;
        assert!(matches!(result, Err(InsertRecordError::Internal(_))));
    }

    #[tokio::test]
    async fn test_update_record() {
        let stored = model("abcDEF12", "https://github.com");
        let repo = repo(
            MockDatabase::new(DatabaseBackend::Postgres).append_query_results([vec![stored]]),
        );

        let record = repo
            .update_record(
                &short_id("abcDEF12"),
                QrRecordChanges {
                    original_url: Some(DestinationUrl::parse("https://github.com").unwrap()),
                    ..QrRecordChanges::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(record.original_url.as_str(), "https://github.com");
    }

    #[tokio::test]
    async fn test_update_record_not_found() {
        let repo = repo(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([Vec::<qr_code::Model>::new()]),
        );

        let result = repo
            .update_record(
                &short_id("abcDEF12"),
                QrRecordChanges {
                    format: Some(QrFormat::Jpg),
                    ..QrRecordChanges::default()
                },
            )
            .await;
        assert!(matches!(result, Err(UpdateRecordError::NotFound)));
    }
}
