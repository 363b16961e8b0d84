mod capture;

pub use capture::{
    configure_ffmpeg_transport, CaptureError, FrameSource, RtspSourceFactory,
    SourceFactory,
};
