#![allow(clippy::unwrap_used)]

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::{
    qr_encoder::{EncodeError, EncodedImage, QrFormat, QrImageEncoder, QrStyle},
    qr_repo::{
        InsertRecordError, NewQrRecord, QrRecord, QrRecordChanges, QrRepository, UpdateRecordError,
    },
    short_id::ShortId,
};

/// [`QrRepository`] over a map, with the same uniqueness and not-found rules as the database.
#[derive(Default)]
pub struct InMemoryQrRepository {
    records: Mutex<HashMap<ShortId, QrRecord>>,
}

impl InMemoryQrRepository {
    pub fn seed(&self, record: QrRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.short_id.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl QrRepository for InMemoryQrRepository {
    async fn find_record(&self, short_id: &ShortId) -> anyhow::Result<Option<QrRecord>> {
        Ok(self.records.lock().unwrap().get(short_id).cloned())
    }

    async fn insert_record(&self, record: NewQrRecord) -> Result<QrRecord, InsertRecordError> {
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&record.short_id) {
            return Err(InsertRecordError::ShortIdTaken);
        }
        let record = record.into_record(OffsetDateTime::now_utc());
        records.insert(record.short_id.clone(), record.clone());
        Ok(record)
    }

    async fn update_record(
        &self,
        short_id: &ShortId,
        changes: QrRecordChanges,
    ) -> Result<QrRecord, UpdateRecordError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(short_id)
            .ok_or(UpdateRecordError::NotFound)?;
        changes.apply_to(record, OffsetDateTime::now_utc());
        Ok(record.clone())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// "Renders" a code as its raw payload, so tests can read back what a scanner would see.
pub struct PayloadEchoEncoder;

impl QrImageEncoder for PayloadEchoEncoder {
    fn encode(
        &self,
        payload: &str,
        _style: &QrStyle,
        format: QrFormat,
    ) -> Result<EncodedImage, EncodeError> {
        Ok(EncodedImage {
            bytes: payload.as_bytes().to_vec(),
            content_type: format.content_type(),
        })
    }
}
