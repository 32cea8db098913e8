type HeaderType = u32;
pub const HEADER_SIZE: usize = size_of::<HeaderType>();
pub type Header = [u8; HEADER_SIZE];

const ERR_H: HeaderType = 0;
const CONTROL_H: HeaderType = 1;
const START_H: HeaderType = 2;
const COMMIT_H: HeaderType = 3;
const TENSOR_H: HeaderType = 4;
const ANY_H: HeaderType = 5;
const RESPONSE_H: HeaderType = 6;
const LOAD_DATA_BLOCK_H: HeaderType = 7;

pub const ERR: Header = ERR_H.to_be_bytes();
pub const CONTROL: Header = CONTROL_H.to_be_bytes();
pub const START: Header = START_H.to_be_bytes();
pub const COMMIT: Header = COMMIT_H.to_be_bytes();
pub const TENSOR: Header = TENSOR_H.to_be_bytes();
pub const ANY: Header = ANY_H.to_be_bytes();
pub const RESPONSE: Header = RESPONSE_H.to_be_bytes();
pub const LOAD_DATA_BLOCK: Header = LOAD_DATA_BLOCK_H.to_be_bytes();

/// Size of the length prefix in front of the json header of data frames.
pub type MetaLen = u32;
pub const META_LEN_SIZE: usize = size_of::<MetaLen>();
