use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::consts::{EPSILON_INSENSITIVITY, HUBER_DELTA, LOSS_CUTOFF};
use crate::error::RstError;

/// Robust loss applied to a normalized residual.
///
/// Every variant saturates for `|a| >= 3`, which bounds the influence of hot
/// pixels and cosmic rays on the gradient-free searches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Loss {
    L1,
    L2,
    #[default]
    Huber,
    Epsilon,
}

impl Loss {
    /// Resolve the variant into a plain function pointer once per call so the
    /// hot loops carry no dispatch.
    pub fn function(self) -> fn(f64) -> f64 {
        match self {
            Loss::L1 => l1_loss,
            Loss::L2 => l2_loss,
            Loss::Huber => huber_loss,
            Loss::Epsilon => epsilon_loss,
        }
    }

    pub fn evaluate(self, a: f64) -> f64 {
        (self.function())(a)
    }
}

fn l2_loss(a: f64) -> f64 {
    let aa = a.abs();
    if aa < LOSS_CUTOFF {
        aa * aa
    } else {
        LOSS_CUTOFF * LOSS_CUTOFF
    }
}

fn l1_loss(a: f64) -> f64 {
    a.abs().min(LOSS_CUTOFF)
}

fn huber_loss(a: f64) -> f64 {
    let aa = a.abs();
    if aa < HUBER_DELTA {
        0.5 * aa * aa
    } else if aa < LOSS_CUTOFF {
        HUBER_DELTA * (aa - 0.5 * HUBER_DELTA)
    } else {
        HUBER_DELTA * (LOSS_CUTOFF - 0.5 * HUBER_DELTA)
    }
}

fn epsilon_loss(a: f64) -> f64 {
    let aa = a.abs();
    if aa < EPSILON_INSENSITIVITY {
        0.0
    } else if aa < LOSS_CUTOFF {
        aa - EPSILON_INSENSITIVITY
    } else {
        LOSS_CUTOFF - EPSILON_INSENSITIVITY
    }
}

impl fmt::Display for Loss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Loss::L1 => write!(f, "L1"),
            Loss::L2 => write!(f, "L2"),
            Loss::Huber => write!(f, "Huber"),
            Loss::Epsilon => write!(f, "Epsilon"),
        }
    }
}

impl FromStr for Loss {
    type Err = RstError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "l1" => Ok(Loss::L1),
            "l2" => Ok(Loss::L2),
            "huber" => Ok(Loss::Huber),
            "epsilon" => Ok(Loss::Epsilon),
            _ => Err(RstError::InvalidLoss(s.to_string())),
        }
    }
}
