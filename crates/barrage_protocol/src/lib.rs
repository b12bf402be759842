#![forbid(unsafe_code)]

pub mod compress;
pub mod framing;
pub mod record;

pub use compress::{CompressError, decompress, expand};
pub use framing::{
	Frame, FrameHeader, FrameLimits, FramingError, HEADER_LEN, Operation, SplitReport, encode_frame, encode_frame_into,
	split_frames,
};
pub use record::ViewerRecord;
