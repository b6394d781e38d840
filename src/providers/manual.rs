//! Manual entry and REST submission (§4.5). Both call sites share the same
//! validation: the characteristic exists, its data source (if any) accepts
//! this source kind, and the measurement count matches the subgroup size
//! (unless the characteristic allows variable-n).

use std::sync::Arc;

use chrono::Utc;

use crate::db::models::DataSourceSpec;
use crate::db::repositories::{CharacteristicRepository, DataSourceRepository};
use crate::providers::{Error, Result, SampleContext, SampleEvent, SourceKind};

/// Thin request-handling provider for the manual-entry and REST-submit
/// surfaces. Holds no buffers of its own — every submission is already a
/// complete subgroup (§4.5: "Emit exactly one `SampleEvent`").
pub struct ManualProvider<C, D> {
    characteristics: Arc<C>,
    data_sources: Arc<D>,
}

impl<C, D> ManualProvider<C, D>
where
    C: CharacteristicRepository,
    D: DataSourceRepository,
{
    pub fn new(characteristics: Arc<C>, data_sources: Arc<D>) -> Self {
        ManualProvider {
            characteristics,
            data_sources,
        }
    }

    /// Validates and normalizes a manual/REST submission into a
    /// [`SampleEvent`] (§4.5).
    pub async fn submit(
        &self,
        characteristic_id: i64,
        measurements: Vec<f64>,
        context: SampleContext,
    ) -> Result<SampleEvent> {
        let source = context.source.unwrap_or(SourceKind::Manual);

        let characteristic = self
            .characteristics
            .get(characteristic_id)
            .await?
            .ok_or(Error::CharacteristicNotFound(characteristic_id))?;

        // A characteristic bound to an automated source (MQTT/OPC-UA)
        // refuses manual/REST submissions for the same slot (§4.5 errors).
        if let Some(data_source) = self.data_sources.get_for_characteristic(characteristic_id).await? {
            if data_source.is_active && !matches!(data_source.spec, DataSourceSpec::Manual) {
                return Err(Error::ProviderTypeMismatch {
                    characteristic_id,
                    attempted: source,
                });
            }
        }

        if measurements.is_empty() {
            return Err(Error::MeasurementCountMismatch {
                characteristic_id,
                expected: characteristic.subgroup_size,
                got: 0,
            });
        }
        if measurements.len() != characteristic.subgroup_size as usize {
            return Err(Error::MeasurementCountMismatch {
                characteristic_id,
                expected: characteristic.subgroup_size,
                got: measurements.len(),
            });
        }

        Ok(SampleEvent {
            characteristic_id,
            measurements,
            timestamp: Utc::now(),
            context: SampleContext {
                source: Some(source),
                ..context
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    use crate::db::models::{Characteristic, CharacteristicRule, DataSource, TriggerStrategy};

    struct FakeCharRepo {
        characteristic: Option<Characteristic>,
    }

    #[async_trait]
    impl CharacteristicRepository for FakeCharRepo {
        async fn get(&self, _characteristic_id: i64) -> crate::Result<Option<Characteristic>> {
            Ok(self.characteristic.clone())
        }

        async fn rules(&self, _characteristic_id: i64) -> crate::Result<HashMap<u8, CharacteristicRule>> {
            Ok(HashMap::new())
        }

        async fn update_limits(
            &self,
            _characteristic_id: i64,
            _center_line: f64,
            _ucl: f64,
            _lcl: f64,
            _sigma: f64,
        ) -> crate::Result<()> {
            Ok(())
        }
    }

    struct FakeDataSourceRepo {
        source: Option<DataSource>,
    }

    #[async_trait]
    impl DataSourceRepository for FakeDataSourceRepo {
        async fn get_for_characteristic(&self, _characteristic_id: i64) -> crate::Result<Option<DataSource>> {
            Ok(self.source.clone())
        }

        async fn list_active_mqtt(&self) -> crate::Result<Vec<(DataSource, Characteristic)>> {
            Ok(vec![])
        }

        async fn list_active_opcua(&self) -> crate::Result<Vec<(DataSource, Characteristic)>> {
            Ok(vec![])
        }
    }

    fn characteristic(subgroup_size: i32) -> Characteristic {
        Characteristic {
            id: 1,
            hierarchy_node_id: 1,
            name: "bore diameter".to_string(),
            subgroup_size,
            target: None,
            usl: None,
            lsl: None,
            center_line: None,
            ucl: None,
            lcl: None,
            sigma: None,
            allows_variable_n: false,
        }
    }

    #[tokio::test]
    async fn valid_submission_emits_one_event() {
        let provider = ManualProvider::new(
            Arc::new(FakeCharRepo {
                characteristic: Some(characteristic(3)),
            }),
            Arc::new(FakeDataSourceRepo { source: None }),
        );
        let event = provider
            .submit(1, vec![1.0, 2.0, 3.0], SampleContext::default())
            .await
            .unwrap();
        assert_eq!(event.measurements, vec![1.0, 2.0, 3.0]);
        assert_eq!(event.context.source, Some(SourceKind::Manual));
    }

    #[tokio::test]
    async fn unknown_characteristic_is_rejected() {
        let provider = ManualProvider::new(
            Arc::new(FakeCharRepo { characteristic: None }),
            Arc::new(FakeDataSourceRepo { source: None }),
        );
        let err = provider
            .submit(99, vec![1.0], SampleContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CharacteristicNotFound(99)));
    }

    #[tokio::test]
    async fn measurement_count_mismatch_is_rejected() {
        let provider = ManualProvider::new(
            Arc::new(FakeCharRepo {
                characteristic: Some(characteristic(5)),
            }),
            Arc::new(FakeDataSourceRepo { source: None }),
        );
        let err = provider
            .submit(1, vec![1.0, 2.0], SampleContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MeasurementCountMismatch { expected: 5, got: 2, .. }));
    }

    #[tokio::test]
    async fn automated_source_rejects_manual_submission() {
        let provider = ManualProvider::new(
            Arc::new(FakeCharRepo {
                characteristic: Some(characteristic(3)),
            }),
            Arc::new(FakeDataSourceRepo {
                source: Some(DataSource {
                    id: 1,
                    characteristic_id: 1,
                    is_active: true,
                    trigger_strategy: TriggerStrategy::OnChange,
                    spec: crate::db::models::DataSourceSpec::Mqtt {
                        broker_id: 1,
                        topic: "line1/sensor".to_string(),
                        metric_name: None,
                        trigger_tag: None,
                    },
                }),
            }),
        );
        let err = provider
            .submit(1, vec![1.0, 2.0, 3.0], SampleContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderTypeMismatch { .. }));
    }
}
