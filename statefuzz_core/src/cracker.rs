use crate::data_model::{DataModel, ElementKind, NodeId};
use thiserror::Error;
use tracing::trace;

/// Reasons a byte stream could not be parsed into a data model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CrackError {
    #[error("'{element}' does not match the input: {reason}")]
    Mismatch { element: String, reason: String },

    #[error("'{element}' needs {needed} bytes but only {available} remain")]
    Truncated {
        element: String,
        needed: usize,
        available: usize,
    },

    #[error("{0} trailing bytes were left after cracking")]
    TrailingBytes(usize),
}

/// Parses raw bytes into a model according to its declared shape.
///
/// On failure the model must be left exactly as it was before the call.
pub trait DataCracker: Send + Sync {
    fn crack(&self, model: &mut DataModel, bytes: &[u8]) -> Result<(), CrackError>;
}

/// Sequential cracker for flat and nested block models.
///
/// Fixed-size leaves consume their width. A single unsized leaf consumes whatever is
/// left once the fixed leaves after it are accounted for; two unsized leaves with no
/// fixed boundary between them are ambiguous and rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModelCracker;

impl ModelCracker {
    pub fn new() -> Self {
        ModelCracker
    }

    fn leaf_size(
        model: &DataModel,
        leaves: &[NodeId],
        position: usize,
        remaining: usize,
    ) -> Result<usize, CrackError> {
        let id = leaves[position];
        let fixed = model.element(id).and_then(|e| e.kind.fixed_size());
        if let Some(size) = fixed {
            return Ok(size);
        }
        let mut tail = 0usize;
        for later in &leaves[position + 1..] {
            match model.element(*later).and_then(|e| e.kind.fixed_size()) {
                Some(size) => tail += size,
                None => {
                    return Err(CrackError::Mismatch {
                        element: model.full_name(id),
                        reason: format!(
                            "unsized element is followed by unsized '{}'",
                            model.full_name(*later)
                        ),
                    });
                }
            }
        }
        remaining.checked_sub(tail).ok_or(CrackError::Truncated {
            element: model.full_name(id),
            needed: tail,
            available: remaining,
        })
    }
}

impl DataCracker for ModelCracker {
    fn crack(&self, model: &mut DataModel, bytes: &[u8]) -> Result<(), CrackError> {
        let leaves = model.leaf_ids();
        let mut staged = model.clone();
        let mut offset = 0usize;

        for position in 0..leaves.len() {
            let id = leaves[position];
            let remaining = bytes.len() - offset;
            let size = Self::leaf_size(&staged, &leaves, position, remaining)?;
            if size > remaining {
                return Err(CrackError::Truncated {
                    element: staged.full_name(id),
                    needed: size,
                    available: remaining,
                });
            }
            let chunk = &bytes[offset..offset + size];

            let (is_token, is_string) = match staged.element(id) {
                Some(e) => (e.token, matches!(e.kind, ElementKind::Str { .. })),
                None => (false, false),
            };
            if is_token && staged.leaf_bytes(id).as_deref() != Some(chunk) {
                return Err(CrackError::Mismatch {
                    element: staged.full_name(id),
                    reason: "token value differs".into(),
                });
            }
            if is_string && std::str::from_utf8(chunk).is_err() {
                return Err(CrackError::Mismatch {
                    element: staged.full_name(id),
                    reason: "string is not valid UTF-8".into(),
                });
            }
            staged
                .set_leaf_bytes(id, chunk)
                .map_err(|e| CrackError::Mismatch {
                    element: staged.full_name(id),
                    reason: e.to_string(),
                })?;
            trace!(element = %staged.full_name(id), size, "cracked element");
            offset += size;
        }

        if offset < bytes.len() {
            return Err(CrackError::TrailingBytes(bytes.len() - offset));
        }
        *model = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response() -> DataModel {
        DataModel::builder("Response")
            .fixed_string("status", "OK", 2)
            .token()
            .number("code", 2, true, 0)
            .blob("payload", Vec::new())
            .number("crc", 1, true, 0)
            .build()
    }

    #[test]
    fn cracks_unsized_leaf_before_fixed_tail() {
        let mut model = response();
        ModelCracker::new()
            .crack(&mut model, b"OK\x01\x02hello\x7f")
            .unwrap();
        let code = model.find("code").unwrap();
        let payload = model.find("payload").unwrap();
        let crc = model.find("crc").unwrap();
        assert_eq!(model.leaf_bytes(code).unwrap(), vec![1, 2]);
        assert_eq!(model.leaf_bytes(payload).unwrap(), b"hello".to_vec());
        assert_eq!(model.leaf_bytes(crc).unwrap(), vec![0x7f]);
        assert_eq!(model.value(), b"OK\x01\x02hello\x7f");
    }

    #[test]
    fn token_mismatch_leaves_model_untouched() {
        let mut model = response();
        let before = model.value().to_vec();
        let err = ModelCracker::new()
            .crack(&mut model, b"NO\x01\x02x\x00")
            .unwrap_err();
        assert!(matches!(err, CrackError::Mismatch { ref element, .. } if element == "Response.status"));
        assert_eq!(model.value(), before.as_slice());
    }

    #[test]
    fn short_input_is_truncated() {
        let mut model = response();
        let err = ModelCracker::new().crack(&mut model, b"OK\x01").unwrap_err();
        assert!(matches!(err, CrackError::Truncated { .. }));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut model = DataModel::builder("Fixed").number("n", 1, true, 0).build();
        let err = ModelCracker::new().crack(&mut model, b"\x01\x02").unwrap_err();
        assert_eq!(err, CrackError::TrailingBytes(1));
    }

    #[test]
    fn two_unsized_leaves_are_ambiguous() {
        let mut model = DataModel::builder("Ambiguous")
            .string("a", "")
            .string("b", "")
            .build();
        let err = ModelCracker::new().crack(&mut model, b"abc").unwrap_err();
        assert!(matches!(err, CrackError::Mismatch { .. }));
    }
}
