//! Descriptor classification
//!
//! Tags every parameter once so the invocation engine and trampolines know
//! which parameters consume script values and which are filled in by a
//! sibling (array lengths, callback user-data, destroy-notify slots).

use super::descriptor::CallableDescriptor;
use super::types::TypeTag;
use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Normal,
    Array,
    Callback,
    /// Filled in by the owning Array or Callback parameter
    Skipped,
}

/// Per-parameter tags plus script-side arity, computed once per callable
#[derive(Debug, Clone)]
pub struct Classification {
    kinds: Vec<ParamKind>,
    expected_inputs: usize,
    expected_outputs: usize,
}

impl Classification {
    /// Classify a callable invoked from script
    pub fn classify(desc: &CallableDescriptor) -> Result<Self> {
        let mut kinds = presized(desc)?;

        for (i, arg) in desc.args().iter().enumerate() {
            if kinds[i] == Some(ParamKind::Skipped) {
                continue;
            }

            let kind = match &arg.ty {
                // Owned by a callback declared later (or by none at all)
                TypeTag::DestroyNotify => ParamKind::Skipped,
                TypeTag::Callback(_) => {
                    if arg.destroy.is_some() && arg.closure.is_none() {
                        return Err(BridgeError::Unsupported(format!(
                            "Function {}.{} has a GDestroyNotify but no user_data, not supported",
                            desc.namespace(),
                            desc.name()
                        )));
                    }
                    for sibling in [arg.destroy, arg.closure].into_iter().flatten() {
                        check_index(desc, sibling)?;
                        kinds[sibling] = Some(ParamKind::Skipped);
                    }
                    ParamKind::Callback
                }
                TypeTag::Array(info) if info.length.is_some() => {
                    let length = info.length.unwrap_or_default();
                    check_length(desc, i, length)?;
                    kinds[length] = Some(ParamKind::Skipped);
                    ParamKind::Array
                }
                _ => ParamKind::Normal,
            };
            kinds[i] = Some(kind);
        }

        Ok(Self::finish(desc, kinds))
    }

    /// Classify a callback signature for a trampoline
    ///
    /// User-data pointers are skipped, and callbacks taking callbacks are
    /// rejected.
    pub fn for_callback(desc: &CallableDescriptor) -> Result<Self> {
        let mut kinds = presized(desc)?;

        for (i, arg) in desc.args().iter().enumerate() {
            if kinds[i] == Some(ParamKind::Skipped) {
                continue;
            }

            let kind = match &arg.ty {
                TypeTag::Pointer => ParamKind::Skipped,
                TypeTag::Callback(_) | TypeTag::DestroyNotify => {
                    return Err(BridgeError::Unsupported(
                        "Callback accepts another callback as a parameter. This is not supported"
                            .to_string(),
                    ));
                }
                TypeTag::Array(info) if info.length.is_some() => {
                    let length = info.length.unwrap_or_default();
                    check_length(desc, i, length)?;
                    kinds[length] = Some(ParamKind::Skipped);
                    ParamKind::Array
                }
                _ => ParamKind::Normal,
            };
            kinds[i] = Some(kind);
        }

        Ok(Self::finish(desc, kinds))
    }

    fn finish(desc: &CallableDescriptor, kinds: Vec<Option<ParamKind>>) -> Self {
        let kinds: Vec<ParamKind> = kinds
            .into_iter()
            .map(|k| k.unwrap_or(ParamKind::Normal))
            .collect();

        let mut expected_inputs = 0;
        let mut expected_outputs = usize::from(!desc.return_info().ty.is_void());

        for (arg, kind) in desc.args().iter().zip(&kinds) {
            match kind {
                ParamKind::Skipped => continue,
                ParamKind::Callback => expected_inputs += 1,
                ParamKind::Normal | ParamKind::Array => {
                    if arg.direction.is_input() {
                        expected_inputs += 1;
                    }
                }
            }
            if arg.direction.is_output() {
                expected_outputs += 1;
            }
        }

        Self { kinds, expected_inputs, expected_outputs }
    }

    #[inline]
    pub fn kinds(&self) -> &[ParamKind] {
        &self.kinds
    }

    #[inline]
    pub fn kind(&self, index: usize) -> ParamKind {
        self.kinds[index]
    }

    /// Script arguments the callable consumes
    #[inline]
    pub fn expected_inputs(&self) -> usize {
        self.expected_inputs
    }

    /// Values the callable produces for script: return plus outputs
    #[inline]
    pub fn expected_outputs(&self) -> usize {
        self.expected_outputs
    }
}

/// Start with the return value's length parameter already skipped
fn presized(desc: &CallableDescriptor) -> Result<Vec<Option<ParamKind>>> {
    let mut kinds = vec![None; desc.n_args()];
    if let TypeTag::Array(info) = &desc.return_info().ty {
        if let Some(length) = info.length {
            check_index(desc, length)?;
            kinds[length] = Some(ParamKind::Skipped);
        }
    }
    Ok(kinds)
}

fn check_index(desc: &CallableDescriptor, index: usize) -> Result<()> {
    if index < desc.n_args() {
        Ok(())
    } else {
        Err(BridgeError::Unsupported(format!(
            "Function {}.{} refers to parameter {} but has only {}",
            desc.namespace(),
            desc.name(),
            index,
            desc.n_args()
        )))
    }
}

fn check_length(desc: &CallableDescriptor, array: usize, length: usize) -> Result<()> {
    check_index(desc, length)?;
    if desc.arg(array).direction != desc.arg(length).direction {
        return Err(BridgeError::Unsupported(format!(
            "Function {}.{} has an array with different-direction length arg, not supported",
            desc.namespace(),
            desc.name()
        )));
    }
    Ok(())
}
