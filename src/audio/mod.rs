//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod level;
pub mod synthetic;

pub use buffer::{bytes_to_samples, create_shared_buffer, SampleRingBuffer, SharedRingBuffer};
pub use capture::CaptureDevice;
pub use device::{
    list_input_devices, CaptureBackend, CaptureStats, CaptureStream, CpalBackend, DeviceInfo,
    FormatInfo, Packet, PacketSink,
};
pub use synthetic::{SyntheticBackend, SyntheticSource};
