//! V4L2 capture device.
//!
//! This module provides `V4l2Device` for capturing frames from local V4L2
//! device nodes (e.g. /dev/video0) using mmap streaming in RGB3.
//!
//! The kernel keeps a small ring of filled buffers. The backlog probe is a
//! zero-timeout `poll(2)` on the device descriptor: readable means another
//! buffer is already dequeueable, so the frame just read is stale.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::time::Duration;

use super::device::{CameraConfig, CaptureDevice};
use crate::frame::Frame;

const MMAP_BUFFER_COUNT: u32 = 4;
/// Upper bound on a single dequeue, so a stalled camera still lets the drain loop see shutdown.
const READ_TIMEOUT: Duration = Duration::from_millis(300);

pub struct V4l2Device {
    config: CameraConfig,
    state: Option<V4l2State>,
    fd: Option<i32>,
    active_width: u32,
    active_height: u32,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Device {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            fd: None,
        }
    }
}

impl CaptureDevice for V4l2Device {
    fn describe(&self) -> String {
        self.config.device.clone()
    }

    fn open(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open v4l2 device {}", self.config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Device: failed to set format on {}: {}",
                    self.config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        if format.fourcc != v4l::FourCC::new(b"RGB3") {
            return Err(anyhow!(
                "v4l2 device {} does not deliver RGB3 (got {})",
                self.config.device,
                format.fourcc
            ));
        }

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Device: failed to set fps on {}: {}",
                    self.config.device,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.fd = Some(device.handle().fd());

        let state = V4l2StateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(
                    device,
                    Type::VideoCapture,
                    MMAP_BUFFER_COUNT,
                )
                .map(|mut stream| {
                    stream.set_timeout(READ_TIMEOUT);
                    stream
                })
                .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "V4l2Device: opened {} ({}x{})",
            self.config.device,
            self.active_width,
            self.active_height
        );
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not open")?;
        let pixels = state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .context("capture v4l2 frame")?;
        Frame::from_rgb(pixels, self.active_width, self.active_height)
    }

    fn frames_pending(&mut self) -> bool {
        match self.fd {
            Some(fd) => fd_readable(fd),
            None => false,
        }
    }

    fn close(&mut self) {
        if self.state.take().is_some() {
            log::info!("V4l2Device: closed {}", self.config.device);
        }
        self.fd = None;
    }
}

#[cfg(target_os = "linux")]
fn fd_readable(fd: i32) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: pfd is a valid pollfd for the duration of the call and nfds is 1.
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    rc > 0 && (pfd.revents & libc::POLLIN) != 0
}

#[cfg(not(target_os = "linux"))]
fn fd_readable(_fd: i32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dequeue_timeout_stays_below_a_second() {
        assert!(READ_TIMEOUT >= Duration::from_millis(100));
        assert!(READ_TIMEOUT < Duration::from_secs(1));
    }

    #[test]
    fn read_before_open_fails() {
        let mut device = V4l2Device::new(CameraConfig::default());
        assert!(device.read_frame().is_err());
        assert!(!device.frames_pending());
        device.close();
    }
}
