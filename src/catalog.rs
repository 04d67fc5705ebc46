//! Immutable per-symbol trading parameters.
//!
//! The [`ProductCatalog`] is built once by the operator, validated, and
//! handed to the engine at construction. It is never mutated afterwards:
//! live reconfiguration is a sequenced command that swaps in a new catalog,
//! not a side-channel mutation.

use crate::book::stp::StpPolicy;
use crate::money::Micros;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Number of circuit-breaker bands per symbol.
pub const BAND_COUNT: usize = 3;

/// One circuit-breaker band: a deviation threshold and the halt it triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBand {
    /// Maximum allowed deviation from the reference price, in basis points.
    pub deviation_bps: u32,
    /// Duration of the halt triggered by breaching this band, milliseconds.
    pub halt_ms: u64,
}

/// Validation errors raised while building a [`ProductCatalog`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CatalogError {
    /// A symbol was registered twice.
    #[error("duplicate symbol: {0}")]
    DuplicateSymbol(String),

    /// Tick size must be strictly positive.
    #[error("symbol {symbol}: tick size {tick} must be positive")]
    InvalidTick {
        /// The offending symbol.
        symbol: String,
        /// The rejected tick size in micro-units.
        tick: i64,
    },

    /// Lot size must be strictly positive.
    #[error("symbol {symbol}: lot size {lot} must be positive")]
    InvalidLot {
        /// The offending symbol.
        symbol: String,
        /// The rejected lot size.
        lot: i64,
    },

    /// `min_order` must be positive and no greater than `max_order`.
    #[error("symbol {symbol}: order size bounds [{min}, {max}] are incoherent")]
    InvalidSizeBounds {
        /// The offending symbol.
        symbol: String,
        /// Configured minimum order size.
        min: i64,
        /// Configured maximum order size.
        max: i64,
    },

    /// Circuit bands must widen monotonically.
    #[error("symbol {symbol}: circuit bands must be strictly increasing")]
    InvalidBands {
        /// The offending symbol.
        symbol: String,
    },

    /// Margin rates must satisfy `0 < maintenance <= initial`.
    #[error("symbol {symbol}: margin rates initial={initial_bps}bps maintenance={maintenance_bps}bps are incoherent")]
    InvalidMargins {
        /// The offending symbol.
        symbol: String,
        /// Initial margin requirement in basis points.
        initial_bps: u32,
        /// Maintenance margin requirement in basis points.
        maintenance_bps: u32,
    },
}

/// Immutable parameters for a single tradable symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSpec {
    /// The symbol this spec applies to.
    pub symbol: String,
    /// Minimum price increment in micro-units. Limit and trigger prices
    /// must be exact multiples.
    pub tick_size: Micros,
    /// Minimum quantity increment in lots.
    pub lot_size: i64,
    /// Smallest accepted order quantity, in lots.
    pub min_order: i64,
    /// Largest accepted order quantity, in lots.
    pub max_order: i64,
    /// Maker fee in basis points of notional. Negative values are rebates.
    pub maker_fee_bps: i32,
    /// Taker fee in basis points of notional.
    pub taker_fee_bps: i32,
    /// Initial margin requirement in basis points of notional.
    pub initial_margin_bps: u32,
    /// Maintenance margin requirement in basis points of notional.
    pub maintenance_margin_bps: u32,
    /// Maximum leverage exposed to the UI; informational at this layer.
    pub max_leverage: u32,
    /// Circuit-breaker bands, strictly widening.
    pub circuit_bands: [CircuitBand; BAND_COUNT],
    /// Self-trade prevention policy applied by the matching engine.
    pub stp_policy: StpPolicy,
    /// Whether the hedging loop may trade this symbol externally.
    pub is_hedgeable: bool,
    /// Identifier of the reference price source feeding this symbol.
    pub reference_source_id: String,
}

impl SymbolSpec {
    fn validate(&self) -> Result<(), CatalogError> {
        if self.tick_size.raw() <= 0 {
            return Err(CatalogError::InvalidTick {
                symbol: self.symbol.clone(),
                tick: self.tick_size.raw(),
            });
        }
        if self.lot_size <= 0 {
            return Err(CatalogError::InvalidLot {
                symbol: self.symbol.clone(),
                lot: self.lot_size,
            });
        }
        if self.min_order <= 0 || self.min_order > self.max_order {
            return Err(CatalogError::InvalidSizeBounds {
                symbol: self.symbol.clone(),
                min: self.min_order,
                max: self.max_order,
            });
        }
        let widening = self
            .circuit_bands
            .windows(2)
            .all(|w| w[0].deviation_bps < w[1].deviation_bps);
        if !widening {
            return Err(CatalogError::InvalidBands {
                symbol: self.symbol.clone(),
            });
        }
        if self.maintenance_margin_bps == 0 || self.maintenance_margin_bps > self.initial_margin_bps
        {
            return Err(CatalogError::InvalidMargins {
                symbol: self.symbol.clone(),
                initial_bps: self.initial_margin_bps,
                maintenance_bps: self.maintenance_margin_bps,
            });
        }
        Ok(())
    }
}

/// Immutable registry of [`SymbolSpec`]s, keyed by symbol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductCatalog {
    specs: HashMap<String, SymbolSpec>,
}

impl ProductCatalog {
    /// Build a catalog from a list of specs, validating each one.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] for duplicate symbols or incoherent
    /// per-symbol parameters.
    pub fn new(specs: impl IntoIterator<Item = SymbolSpec>) -> Result<Self, CatalogError> {
        let mut map: HashMap<String, SymbolSpec> = HashMap::new();
        for spec in specs {
            spec.validate()?;
            if map.contains_key(&spec.symbol) {
                return Err(CatalogError::DuplicateSymbol(spec.symbol));
            }
            map.insert(spec.symbol.clone(), spec);
        }
        Ok(Self { specs: map })
    }

    /// Look up the spec for `symbol`, or `None` for unknown symbols.
    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<&SymbolSpec> {
        self.specs.get(symbol)
    }

    /// Whether the catalog knows `symbol`.
    #[must_use]
    pub fn contains(&self, symbol: &str) -> bool {
        self.specs.contains_key(symbol)
    }

    /// All registered symbols, in unspecified order.
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }

    /// Number of registered symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
