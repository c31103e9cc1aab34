//! Listener that writes every reading to the log

use super::{ListenerContext, ListenerParams};
use common::{DataListener, DataPoint, Result};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Default)]
pub struct LoggingListener;

impl LoggingListener {
    pub const TAG: &'static str = "LoggingListener";

    pub fn from_params(
        _params: &ListenerParams,
        _context: &ListenerContext,
    ) -> Result<Arc<dyn DataListener>> {
        Ok(Arc::new(Self))
    }
}

impl DataListener for LoggingListener {
    fn name(&self) -> &str {
        Self::TAG
    }

    fn on_new_data(&self, point: Arc<DataPoint>) -> anyhow::Result<()> {
        info!(
            "Datapoint: sensor {}, raw {}, cooked {:.6} {}, timestamp {} from sensor {} type {}",
            point.sensor_id,
            point.raw_value,
            point.cooked(),
            point.sensor.unit(),
            point.timestamp,
            point.sensor.name(),
            point.sensor.kind()
        );
        Ok(())
    }
}
