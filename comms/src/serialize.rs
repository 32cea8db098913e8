use std::io;

/// Types that can be written as the body of a frame.
pub trait Serialize<'a> {
    /// Appends the serialized body to `buf`.
    ///
    /// # Returns
    /// An optional tail borrowed from `self` which is written right after `buf`
    /// without copying, or an io error if the body couldn't be encoded.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
