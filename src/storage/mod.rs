/*! Specialized containers.

The `storage` module provides the two buffers a TCP connection owns: the
chunked [SendBuffer] for outgoing application data, and the [ReorderBuffer]
for received segments that arrived ahead of a gap.
*/

mod reorder;
mod send_buffer;

pub use self::reorder::ReorderBuffer;
pub use self::send_buffer::SendBuffer;
