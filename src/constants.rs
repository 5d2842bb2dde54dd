//! Constants governing audio framing, transmission pacing, and protocol
//! handling.

use audiopus::{Bitrate, SampleRate};
use discortp::rtp::RtpType;
use std::time::Duration;

/// The voice gateway version spoken by this library.
pub const VOICE_GATEWAY_VERSION: u8 = 4;

/// Audio sample rate the voice gateway expects.
pub const SAMPLE_RATE: SampleRate = SampleRate::Hz48000;

/// [`SAMPLE_RATE`], as a plain number of samples per second.
pub const SAMPLE_RATE_RAW: usize = 48_000;

/// Audio frames sent per second at the 20 ms timestep.
pub const AUDIO_FRAME_RATE: usize = 50;

/// Interval between two consecutive audio frames.
pub const TIMESTEP_LENGTH: Duration = Duration::from_millis(1000 / AUDIO_FRAME_RATE as u64);

/// Encoder bitrate.
pub const DEFAULT_BITRATE: Bitrate = Bitrate::BitsPerSecond(128_000);

/// Samples per channel in one 20 ms frame.
pub const MONO_FRAME_SIZE: usize = SAMPLE_RATE_RAW / AUDIO_FRAME_RATE;

/// Interleaved samples in one 20 ms stereo frame.
pub const STEREO_FRAME_SIZE: usize = 2 * MONO_FRAME_SIZE;

/// Bytes of raw `i16` PCM making up one 20 ms stereo frame.
pub const STEREO_FRAME_BYTE_SIZE: usize = STEREO_FRAME_SIZE * std::mem::size_of::<i16>();

/// Maximum length of a single encoded Opus frame.
pub const MAX_OPUS_FRAME_SIZE: usize = 1276;

/// Opus silent frame, used to flush server-side jitter buffers at stream end.
pub const SILENT_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Number of silent frames appended once a source runs dry.
pub const SILENT_FRAME_COUNT: usize = 10;

/// Advance of the RTP timestamp per audio frame.
pub const TIMESTAMP_STEP: u32 = MONO_FRAME_SIZE as u32;

/// RTP protocol version (there has only ever been the one).
pub const RTP_VERSION: u8 = 2;

/// Dynamic RTP payload type under which Discord carries Opus.
pub const RTP_PROFILE_TYPE: RtpType = RtpType::Dynamic(120);

/// Size of the scratch buffer backing one voice packet.
///
/// Comfortably under a typical MTU, so packets never fragment.
pub const VOICE_PACKET_MAX: usize = 1460;

/// Capacity, in frames, of each session's outbound Opus queue.
///
/// Roughly ten seconds of audio; the bound is the backpressure mechanism and
/// must not be lifted.
pub const OPUS_FRAME_BUFFER: usize = 500;

/// Capacity of each session's inbound packet queue.
pub const INBOUND_PACKET_BUFFER: usize = 64;

/// Encryption scheme negotiated with the voice server.
pub const CRYPTO_MODE: &str = "xsalsa20_poly1305";

/// Delay between sends of UDP keepalive frames.
///
/// Official clients emit one every five seconds whether or not audio is
/// flowing.
pub const UDP_KEEPALIVE_GAP: Duration = Duration::from_millis(5_000);

/// Budget for the two gateway events answering an Update Voice State.
pub const GATEWAY_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for Hello + Ready (or Hello + Resumed) on the voice websocket.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between failed Resume attempts.
pub const RESUME_BACKOFF: Duration = Duration::from_secs(5);

/// Quiet period before the first heartbeat is sent.
pub const HEARTBEAT_WARMUP: Duration = Duration::from_secs(1);

/// Minimum spacing between any two outgoing websocket frames.
pub const WS_SEND_GAP: Duration = Duration::from_millis(516);
