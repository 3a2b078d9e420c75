use crate::{Error, Result};

/// Coordination-service paths for one slot pool.
///
/// Every pool lives under a caller-chosen base path:
///
/// | Path | Purpose |
/// |---|---|
/// | `{base}/pool/counter` | bounded growth counter |
/// | `{base}/queue` | relinquished slots available for reuse |
/// | `{base}/claims/{slot}` | best-effort claim record |
///
/// # Example
///
/// ```
/// use ferroid_lease::PoolLayout;
///
/// let layout = PoolLayout::new("/unique-id-generator").unwrap();
/// assert_eq!(layout.counter(), "/unique-id-generator/pool/counter");
/// assert_eq!(layout.claim(7), "/unique-id-generator/claims/7");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolLayout {
    base: String,
}

impl PoolLayout {
    /// Validates `base_path` and builds the layout beneath it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] unless the path is absolute, has no
    /// trailing slash and contains no empty segments.
    pub fn new(base_path: &str) -> Result<Self> {
        if !base_path.starts_with('/') {
            return Err(Error::invalid(format!(
                "base path `{base_path}` must start with `/`"
            )));
        }
        if base_path.len() == 1 || base_path.ends_with('/') {
            return Err(Error::invalid(format!(
                "base path `{base_path}` must name a node below the root"
            )));
        }
        if base_path.contains("//") {
            return Err(Error::invalid(format!(
                "base path `{base_path}` contains an empty segment"
            )));
        }
        Ok(Self {
            base: base_path.to_owned(),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn counter(&self) -> String {
        format!("{}/pool/counter", self.base)
    }

    pub fn queue(&self) -> String {
        format!("{}/queue", self.base)
    }

    pub fn claim(&self, slot: u32) -> String {
        format!("{}/claims/{slot}", self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_paths_below_base() {
        let layout = PoolLayout::new("/ids/region-a").unwrap();
        assert_eq!(layout.base(), "/ids/region-a");
        assert_eq!(layout.counter(), "/ids/region-a/pool/counter");
        assert_eq!(layout.queue(), "/ids/region-a/queue");
        assert_eq!(layout.claim(63), "/ids/region-a/claims/63");
    }

    #[test]
    fn rejects_malformed_base_paths() {
        for bad in ["", "/", "ids", "/ids/", "/ids//a"] {
            assert!(
                matches!(PoolLayout::new(bad), Err(Error::InvalidArgument { .. })),
                "accepted `{bad}`"
            );
        }
    }
}
