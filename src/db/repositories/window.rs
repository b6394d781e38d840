//! The persistence-facing half of the rolling window manager (§4.2): the
//! newest `W` samples for a characteristic plus its currently stored zone
//! boundaries. Delegates to [`SampleRepository`] and
//! [`CharacteristicRepository`] rather than querying directly, so the two
//! stay the single source of truth for their tables.

use std::sync::Arc;

use async_trait::async_trait;

use crate::db::repositories::{CharacteristicRepository, SampleRepository};
use crate::error::Result;
use crate::stats::ZoneBoundaries;
use crate::window::{LoadedSample, WindowRepository};

pub struct PgWindowRepository<S, C> {
    samples: Arc<S>,
    characteristics: Arc<C>,
}

impl<S, C> PgWindowRepository<S, C> {
    pub fn new(samples: Arc<S>, characteristics: Arc<C>) -> Self {
        PgWindowRepository { samples, characteristics }
    }
}

#[async_trait]
impl<S, C> WindowRepository for PgWindowRepository<S, C>
where
    S: SampleRepository,
    C: CharacteristicRepository,
{
    async fn load_recent_samples(&self, characteristic_id: i64, limit: usize) -> Result<Vec<LoadedSample>> {
        self.samples.load_recent_samples(characteristic_id, limit).await
    }

    async fn load_boundaries(&self, characteristic_id: i64) -> Result<Option<ZoneBoundaries>> {
        let characteristic = self.characteristics.get(characteristic_id).await?;
        Ok(characteristic.and_then(|c| c.zone_boundaries()))
    }
}
