use anyhow::{bail, Result};
use rand::Rng;

use crate::{potential::LogpError, transform::Transform};

/// A named latent variable and its support.
///
/// The sites of a model fix the layout of the flat parameter vector: each site
/// occupies `size` consecutive entries, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Site {
    pub name: String,
    pub size: usize,
    pub transform: Transform,
}

impl Site {
    pub fn new(name: impl Into<String>, size: usize) -> Site {
        Site {
            name: name.into(),
            size,
            transform: Transform::Identity,
        }
    }

    pub fn scalar(name: impl Into<String>) -> Site {
        Site::new(name, 1)
    }

    pub fn with_transform(mut self, transform: Transform) -> Site {
        self.transform = transform;
        self
    }
}

/// A posterior density known up to a constant.
///
/// `logp` is evaluated in constrained space and must write the gradient of the
/// log density with respect to the constrained values into `gradient`. The
/// model is shared between chains, so evaluation must not depend on mutable
/// state.
pub trait Model: Send + Sync + 'static {
    type LogpError: LogpError;

    fn sites(&self) -> &[Site];

    fn logp(&self, values: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError>;

    /// Draw constrained values from the prior, used by prior based
    /// initialization strategies.
    fn sample_prior<R: Rng + ?Sized>(&self, _rng: &mut R, _values: &mut [f64]) -> Result<()> {
        bail!("This model does not support drawing from the prior")
    }

    fn dim(&self) -> usize {
        self.sites().iter().map(|site| site.size).sum()
    }
}

/// Iterate over `(site, offset)` pairs of a site layout.
pub(crate) fn site_offsets(sites: &[Site]) -> impl Iterator<Item = (&Site, usize)> + '_ {
    sites.iter().scan(0usize, |offset, site| {
        let start = *offset;
        *offset += site.size;
        Some((site, start))
    })
}

/// One transform per entry of the flat parameter vector.
pub(crate) fn expand_transforms(sites: &[Site]) -> Box<[Transform]> {
    sites
        .iter()
        .flat_map(|site| std::iter::repeat(site.transform).take(site.size))
        .collect()
}
