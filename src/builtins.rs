//! Builtin kernels used for copies, fills and image transfers.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{DriverError, Result};
use crate::kernel::{ArgDescriptor, KernelDescriptor};

/// Operations above this size always use the stateless variants.
pub const STATELESS_THRESHOLD: usize = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    CopyBufferToBufferBytes,
    CopyBufferToBufferMiddle,
    CopyBufferToBufferSide,
    CopyBufferRectRegion2d,
    CopyBufferRectRegion3d,
    FillBufferImmediate,
    FillBufferImmediateLeftOver,
    FillBufferMiddle,
    FillBufferRightLeftover,
    CopyImageRegion,
    CopyImageToBuffer,
    CopyBufferToImage,
}

impl Builtin {
    const ALL: [Builtin; 12] = [
        Builtin::CopyBufferToBufferBytes,
        Builtin::CopyBufferToBufferMiddle,
        Builtin::CopyBufferToBufferSide,
        Builtin::CopyBufferRectRegion2d,
        Builtin::CopyBufferRectRegion3d,
        Builtin::FillBufferImmediate,
        Builtin::FillBufferImmediateLeftOver,
        Builtin::FillBufferMiddle,
        Builtin::FillBufferRightLeftover,
        Builtin::CopyImageRegion,
        Builtin::CopyImageToBuffer,
        Builtin::CopyBufferToImage,
    ];

    fn name(self) -> &'static str {
        match self {
            Builtin::CopyBufferToBufferBytes => "CopyBufferToBufferBytes",
            Builtin::CopyBufferToBufferMiddle => "CopyBufferToBufferMiddle",
            Builtin::CopyBufferToBufferSide => "CopyBufferToBufferSide",
            Builtin::CopyBufferRectRegion2d => "CopyBufferRectBytes2d",
            Builtin::CopyBufferRectRegion3d => "CopyBufferRectBytes3d",
            Builtin::FillBufferImmediate => "FillBufferImmediate",
            Builtin::FillBufferImmediateLeftOver => "FillBufferImmediateLeftOver",
            Builtin::FillBufferMiddle => "FillBufferMiddle",
            Builtin::FillBufferRightLeftover => "FillBufferRightLeftover",
            Builtin::CopyImageRegion => "CopyImageToImage3d",
            Builtin::CopyImageToBuffer => "CopyImage3dToBufferBytes",
            Builtin::CopyBufferToImage => "CopyBufferBytesToImage3d",
        }
    }

    pub fn is_image(self) -> bool {
        matches!(
            self,
            Builtin::CopyImageRegion | Builtin::CopyImageToBuffer | Builtin::CopyBufferToImage
        )
    }

    /// (buffer pointer args, image args) taken by the kernel.
    fn arg_shape(self) -> (usize, usize) {
        match self {
            Builtin::CopyBufferToBufferBytes
            | Builtin::CopyBufferToBufferMiddle
            | Builtin::CopyBufferToBufferSide
            | Builtin::CopyBufferRectRegion2d
            | Builtin::CopyBufferRectRegion3d
            | Builtin::FillBufferMiddle
            | Builtin::FillBufferRightLeftover => (2, 0),
            Builtin::FillBufferImmediate | Builtin::FillBufferImmediateLeftOver => (1, 0),
            Builtin::CopyImageRegion => (0, 2),
            Builtin::CopyImageToBuffer | Builtin::CopyBufferToImage => (1, 1),
        }
    }

    /// Bytes one work item moves.
    pub fn bytes_per_work_item(self) -> usize {
        match self {
            Builtin::CopyBufferToBufferMiddle | Builtin::FillBufferImmediate => 16,
            Builtin::FillBufferMiddle => 4,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinAddressing {
    Stateful,
    Stateless,
}

impl BuiltinAddressing {
    pub fn select(global_stateless: bool, size: usize) -> Self {
        if global_stateless || size > STATELESS_THRESHOLD {
            BuiltinAddressing::Stateless
        } else {
            BuiltinAddressing::Stateful
        }
    }
}

fn build_descriptor(builtin: Builtin, addressing: BuiltinAddressing, kernel_id: u32) -> KernelDescriptor {
    let suffix = match addressing {
        BuiltinAddressing::Stateful => "",
        BuiltinAddressing::Stateless => "Stateless",
    };
    let mut desc = KernelDescriptor::new(&format!("{}{}", builtin.name(), suffix));
    desc.kernel_id = kernel_id;

    let (pointers, images) = builtin.arg_shape();
    let mut surface_states = 0u16;
    for i in 0..pointers as u16 {
        let arg = match addressing {
            BuiltinAddressing::Stateful => {
                surface_states += 1;
                ArgDescriptor::bindful_pointer((surface_states - 1) * 64, i * 8)
            }
            BuiltinAddressing::Stateless => ArgDescriptor::stateless_pointer(i * 8),
        };
        desc.args.push(arg);
    }
    for _ in 0..images {
        surface_states += 1;
        desc.args.push(ArgDescriptor::Image {
            bindful: Some((surface_states - 1) * 64),
            bindless: None,
        });
    }
    // Offsets, sizes and pattern follow the pointers.
    desc.args.push(ArgDescriptor::Value {
        offset: pointers as u16 * 8,
        size: 16,
    });

    desc.num_binding_table_entries = surface_states as u32;
    desc.cross_thread_data_size = 64;
    desc.simd_size = 16;
    desc.group_size = [64, 1, 1];
    desc
}

/// Library of builtin kernels for one device.
#[derive(Debug)]
pub struct BuiltinFunctionsLib {
    kernels: HashMap<(Builtin, BuiltinAddressing), Arc<KernelDescriptor>>,
}

impl BuiltinFunctionsLib {
    pub fn new(image_supported: bool) -> Self {
        let mut kernels = HashMap::new();
        let mut kernel_id = 0x100;
        for builtin in Builtin::ALL {
            if builtin.is_image() && !image_supported {
                continue;
            }
            for addressing in [BuiltinAddressing::Stateful, BuiltinAddressing::Stateless] {
                kernels.insert(
                    (builtin, addressing),
                    Arc::new(build_descriptor(builtin, addressing, kernel_id)),
                );
                kernel_id += 1;
            }
        }
        debug!("Builtin library initialized with {} kernels", kernels.len());
        Self { kernels }
    }

    pub fn get_function(&self, builtin: Builtin, addressing: BuiltinAddressing) -> Result<Arc<KernelDescriptor>> {
        self.kernels
            .get(&(builtin, addressing))
            .cloned()
            .ok_or_else(|| DriverError::UnsupportedFeature(format!("builtin {:?} is not available", builtin)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addressing_selection() {
        assert_eq!(BuiltinAddressing::select(false, 0x1000), BuiltinAddressing::Stateful);
        assert_eq!(BuiltinAddressing::select(true, 0x1000), BuiltinAddressing::Stateless);
        assert_eq!(
            BuiltinAddressing::select(false, STATELESS_THRESHOLD + 1),
            BuiltinAddressing::Stateless
        );
    }

    #[test]
    fn test_stateless_variants_have_no_stateful_args() {
        let lib = BuiltinFunctionsLib::new(true);
        let stateless = lib
            .get_function(Builtin::FillBufferMiddle, BuiltinAddressing::Stateless)
            .unwrap();
        assert_eq!(stateless.first_stateful_arg(), None);
        assert_eq!(stateless.num_binding_table_entries, 0);

        let stateful = lib
            .get_function(Builtin::FillBufferMiddle, BuiltinAddressing::Stateful)
            .unwrap();
        assert_eq!(stateful.first_stateful_arg(), Some(0));
        assert_eq!(stateful.num_binding_table_entries, 2);
    }

    #[test]
    fn test_image_builtins_need_image_support() {
        let lib = BuiltinFunctionsLib::new(false);
        let err = lib
            .get_function(Builtin::CopyImageRegion, BuiltinAddressing::Stateful)
            .unwrap_err();
        assert!(matches!(err, DriverError::UnsupportedFeature(_)));
        assert!(lib
            .get_function(Builtin::CopyBufferToBufferMiddle, BuiltinAddressing::Stateful)
            .is_ok());
    }
}
