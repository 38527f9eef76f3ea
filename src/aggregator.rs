use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::data_models::{EvaluationOutcome, ResultBatch, Verdict};
use crate::error::PersistError;

const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

/// Collects settled outcomes into a timestamped batch and writes it to disk.
pub struct ResultAggregator {
    query: String,
    output_dir: PathBuf,
}

impl ResultAggregator {
    pub fn new(query: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            query: query.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Keeps the given order (settlement order).
    pub fn aggregate(&self, outcomes: Vec<EvaluationOutcome>) -> ResultBatch {
        ResultBatch {
            run_id: nanoid::nanoid!(),
            generated_at: Utc::now(),
            query: self.query.clone(),
            outcomes,
        }
    }

    pub fn batch_path(&self, batch: &ResultBatch) -> PathBuf {
        self.output_dir.join(format!("{}.json", stamp(&batch.generated_at)))
    }

    pub fn relevant_path(&self, batch: &ResultBatch) -> PathBuf {
        self.output_dir
            .join(format!("{}.relevant.json", stamp(&batch.generated_at)))
    }

    /// Writes `<stamp>.json`. An empty batch is still written.
    pub async fn persist(&self, batch: &ResultBatch) -> Result<PathBuf, PersistError> {
        let path = self.batch_path(batch);
        write_json_atomic(&self.output_dir, &path, batch).await?;
        log::info!("saved {} outcomes to {}", batch.total(), path.display());
        Ok(path)
    }

    /// Writes `<stamp>.relevant.json` next to the batch: the candidates whose
    /// verdict equals `threshold`.
    pub async fn persist_relevant(
        &self,
        batch: &ResultBatch,
        threshold: &Verdict,
    ) -> Result<PathBuf, PersistError> {
        let path = self.relevant_path(batch);
        let relevant: Vec<_> = batch
            .matching(threshold)
            .into_iter()
            .map(|o| &o.candidate)
            .collect();
        write_json_atomic(&self.output_dir, &path, &relevant).await?;
        log::info!("saved {} relevant urls to {}", relevant.len(), path.display());
        Ok(path)
    }
}

pub async fn load_batch(path: &Path) -> Result<ResultBatch, PersistError> {
    let raw = tokio::fs::read(path).await.map_err(|source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_slice(&raw)?)
}

fn stamp(at: &DateTime<Utc>) -> String {
    at.format(STAMP_FORMAT).to_string()
}

async fn write_json_atomic<T: Serialize + ?Sized>(
    dir: &Path,
    path: &Path,
    value: &T,
) -> Result<(), PersistError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| PersistError::Io { path, source }
    };

    tokio::fs::create_dir_all(dir).await.map_err(io_err(dir))?;
    let body = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body).await.map_err(io_err(&tmp))?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err(path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stamp_is_filesystem_safe() {
        let at = Utc.with_ymd_and_hms(2024, 8, 6, 17, 4, 9).unwrap();
        let s = stamp(&at);
        assert_eq!(s, "20240806T170409.000Z");
        assert!(!s.contains(':'));
    }
}
