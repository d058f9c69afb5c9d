use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::consts::DEFAULT_TRANSLATION_GRID_SIZE;
use crate::data::{ensure_positive, Sampling, SearchWindow};
use crate::error::{Result, RstError};
use crate::loss::Loss;
use crate::reference::ReferenceMethod;
use crate::refine::SearchStrategy;

/// Parameters of one speckle-tracking run: how the reference is estimated,
/// how pixel maps and translations are refined, the noise scale and the
/// worker count.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Noise scale normalizing the residuals.
    #[serde(default = "default_sigma")]
    pub sigma: f64,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub reference: ReferenceConfig,
    #[serde(default)]
    pub pixel_map: PixelMapConfig,
    #[serde(default)]
    pub translation: TranslationConfig,
}

fn default_sigma() -> f64 {
    1.0
}

fn default_threads() -> usize {
    1
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            sigma: default_sigma(),
            threads: default_threads(),
            reference: ReferenceConfig::default(),
            pixel_map: PixelMapConfig::default(),
            translation: TranslationConfig::default(),
        }
    }
}

impl TrackingConfig {
    pub fn validate(&self) -> Result<()> {
        self.reference.validate()?;
        self.pixel_map.validate()?;
        self.translation.validate()?;
        ensure_positive("sigma", self.sigma)?;
        if self.threads == 0 {
            return Err(RstError::InvalidArgument(
                "thread count must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a TOML document. Missing sections take defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: TrackingConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl fmt::Display for TrackingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reference: {}, pixel map: {}, translations: {}x{} grid, sigma={}, threads={}",
            self.reference.method,
            self.pixel_map.strategy,
            self.translation.grid_size,
            self.translation.grid_size,
            self.sigma,
            self.threads
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub method: ReferenceMethod,
    /// Kernel bandwidth `h`, in detector pixels.
    pub bandwidth: f64,
    pub sampling: Sampling,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            method: ReferenceMethod::default(),
            bandwidth: 1.0,
            sampling: Sampling::default(),
        }
    }
}

impl ReferenceConfig {
    pub fn validate(&self) -> Result<()> {
        self.sampling.validate()?;
        ensure_positive("bandwidth", self.bandwidth)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PixelMapConfig {
    pub loss: Loss,
    pub window: SearchWindow,
    pub strategy: SearchStrategy,
}

impl PixelMapConfig {
    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;
        self.strategy.validate()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub grid_size: usize,
    pub loss: Loss,
    pub window: SearchWindow,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            grid_size: DEFAULT_TRANSLATION_GRID_SIZE,
            loss: Loss::default(),
            window: SearchWindow::default(),
        }
    }
}

impl TranslationConfig {
    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;
        if self.grid_size == 0 {
            return Err(RstError::InvalidArgument(
                "translation grid size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
