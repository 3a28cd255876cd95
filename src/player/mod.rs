// 播放器核心模块

pub mod packet_queue;
pub mod frame_queue;
pub mod control;
pub mod decoder;
pub mod source;
pub mod session;
pub mod sync;
pub mod audio_output;
pub mod stream_decoders;
pub mod reader;
pub mod manager;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_source; // FFmpeg 解封装 / 解码后端

pub use packet_queue::{PacketGet, PacketQueue};
pub use frame_queue::FrameQueue;
pub use control::{ControlState, SeekRequest};
pub use decoder::{CodecBackend, Decoder, DecoderThread, Receive, SendStatus};
pub use source::{AudioBackend, AudioSpec, CodecInstance, MediaSource, ReadOutcome, SourceInfo, StreamInfo, VideoSink};
pub use session::{PlayerEvent, Session};
pub use sync::{Presenter, SyncController};
pub use audio_output::AudioRenderer;
#[cfg(feature = "cpal-output")]
pub use audio_output::CpalAudioBackend;
pub use reader::{ReaderThread, StreamReader};
pub use manager::{HostCommand, Player};
#[cfg(feature = "ffmpeg")]
pub use ffmpeg_source::FfmpegSource;
