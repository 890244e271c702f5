//! Historical bar access port trait.

use crate::domain::error::TraderError;
use crate::domain::ohlcv::Bar;

pub trait DataPort {
    /// At most the last `limit` bars for `symbol`, ascending by timestamp.
    fn fetch_bars(&self, symbol: &str, limit: usize) -> Result<Vec<Bar>, TraderError>;

    fn list_symbols(&self) -> Result<Vec<String>, TraderError>;
}
