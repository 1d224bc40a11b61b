use crate::buffer::BufferKind;

/// This trait is what the binding resolver knows about a buffer
///
/// The resolver never touches the GPU handle itself: it only needs the name to match
/// against the blocks declared in the shader, the kind of block the buffer can feed,
/// its size to check it against the block layout and the allocation it currently points to.
///
/// [`crate::buffer::Buffer`] is the implementation used by the crate, but any type can
/// implement it to test a resolution without a device.
pub trait Bindable {
    /// The name the buffer is registered under
    ///
    /// It has to be identical to the name of the block declared in the shader
    /// (either the variable name or the name of its struct type) to be bound.
    fn get_name(&self) -> &str;

    fn kind(&self) -> BufferKind;

    /// This function gives back the byte size of the allocation
    ///
    /// It's compared with the minimum size the block layout needs: binding a smaller
    /// buffer would make the bind group invalid.
    fn byte_size(&self) -> u64;

    /// An identifier of the allocation, which changes whenever the buffer is reallocated
    ///
    /// A program remembers the allocation each of its bindings was resolved against,
    /// so it can refresh its bind groups when it's not current anymore.
    fn allocation(&self) -> u64;
}
