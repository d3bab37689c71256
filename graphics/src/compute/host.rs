//! Host execution of compute dispatches for the dummy backend.

use crate::error::GraphicsError;
use crate::shader::ShaderDefines;

/// CPU implementation of a compute shader.
///
/// The kernel receives the raw bytes of every bound buffer and must honour
/// the same layout contract as the GLSL source.
pub trait HostKernel: Send + Sync {
    fn execute(&self, dispatch: &mut HostDispatch<'_>) -> Result<(), GraphicsError>;
}

/// Buffers and parameters of one host-executed dispatch.
///
/// Read-only and uniform bindings are shared slices; writable bindings are
/// handed out once each through [`take_write`](HostDispatch::take_write).
pub struct HostDispatch<'a> {
    defines: &'a ShaderDefines,
    workgroups: [u32; 3],
    workgroup_size: [u32; 3],
    reads: Vec<(u32, &'a [u8])>,
    writes: Vec<(u32, &'a mut [u8])>,
}

impl<'a> HostDispatch<'a> {
    pub fn new(
        defines: &'a ShaderDefines,
        workgroups: [u32; 3],
        workgroup_size: [u32; 3],
        reads: Vec<(u32, &'a [u8])>,
        writes: Vec<(u32, &'a mut [u8])>,
    ) -> Self {
        Self {
            defines,
            workgroups,
            workgroup_size,
            reads,
            writes,
        }
    }

    pub fn is_defined(&self, keyword: &str) -> bool {
        self.defines.is_defined(keyword)
    }

    pub fn workgroups(&self) -> [u32; 3] {
        self.workgroups
    }

    /// Total invocations along x (`gl_GlobalInvocationID.x` range).
    pub fn invocations_x(&self) -> u32 {
        self.workgroups[0].saturating_mul(self.workgroup_size[0])
    }

    /// Bytes of a read-only or uniform binding.
    pub fn read(&self, binding: u32) -> Result<&'a [u8], GraphicsError> {
        self.reads
            .iter()
            .find(|(b, _)| *b == binding)
            .map(|(_, bytes)| *bytes)
            .ok_or_else(|| {
                GraphicsError::InvalidParameter(format!("no readable buffer at binding {binding}"))
            })
    }

    /// Takes the bytes of a writable binding. Each binding can be taken once.
    pub fn take_write(&mut self, binding: u32) -> Result<&'a mut [u8], GraphicsError> {
        let position = self
            .writes
            .iter()
            .position(|(b, _)| *b == binding)
            .ok_or_else(|| {
                GraphicsError::InvalidParameter(format!("no writable buffer at binding {binding}"))
            })?;
        Ok(self.writes.swap_remove(position).1)
    }
}

impl std::fmt::Debug for HostDispatch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDispatch")
            .field("defines", &self.defines.to_string())
            .field("workgroups", &self.workgroups)
            .field("reads", &self.reads.iter().map(|(b, _)| *b).collect::<Vec<_>>())
            .field("writes", &self.writes.iter().map(|(b, _)| *b).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_and_take_write() {
        let defines = ShaderDefines::new();
        let input = [1u8, 2, 3, 4];
        let mut output = [0u8; 4];
        let mut dispatch = HostDispatch::new(
            &defines,
            [2, 1, 1],
            [64, 1, 1],
            vec![(0, &input[..])],
            vec![(1, &mut output[..])],
        );

        assert_eq!(dispatch.invocations_x(), 128);
        assert_eq!(dispatch.read(0).unwrap(), &[1, 2, 3, 4]);
        assert!(dispatch.read(1).is_err());

        let out = dispatch.take_write(1).unwrap();
        out.copy_from_slice(&[9, 9, 9, 9]);
        assert!(dispatch.take_write(1).is_err());
        assert_eq!(output, [9, 9, 9, 9]);
    }
}
