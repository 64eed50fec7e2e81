//! V4L2 capture device built on the `v4l` crate.
//!
//! Device setup (open, capabilities, format, frame rate, controls) goes
//! through `v4l::Device`. The streaming handshake is issued one step at a
//! time (request, map, queue, dequeue) with the crate's ioctl bindings, so a
//! buffer can stay lent out to network clients for as long as they need it.
//! `v4l`'s mmap stream requeues the previous buffer on every `next()`.
//!
//! The descriptor is switched to non-blocking: an empty capture queue
//! surfaces as `WouldBlock` from `dequeue_buffer`.

use anyhow::{bail, Context, Result};
use std::io;
use std::mem;
use std::os::raw::{c_int, c_void};
use std::ptr::{self, NonNull};

use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::control::{Control, Value};
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use super::{CaptureDevice, CaptureFormat, FilledBuffer, FrameTimestamp, MappedRegion};

const MJPEG: &[u8; 4] = b"MJPG";

pub struct V4l2Device {
    path: String,
    device: Device,
    fd: c_int,
}

impl V4l2Device {
    /// Opens a capture node and checks it supports streaming video capture.
    pub fn open(path: &str) -> Result<Self> {
        let device =
            Device::with_path(path).with_context(|| format!("open v4l2 device {}", path))?;
        let caps = device
            .query_caps()
            .with_context(|| format!("query capabilities of {}", path))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            bail!("{} is not a video capture device", path);
        }
        if !caps.capabilities.contains(Flags::STREAMING) {
            bail!("{} does not support streaming i/o", path);
        }

        let fd = device.handle().fd();
        set_nonblocking(fd).with_context(|| format!("set {} non-blocking", path))?;
        log::info!(
            "V4l2Device: opened {} ({} / {})",
            path,
            caps.driver,
            caps.card
        );
        Ok(Self {
            path: path.to_string(),
            device,
            fd,
        })
    }

    fn ioctl<T>(&self, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
        // SAFETY: every call site pairs the request with the v4l_sys struct
        // the kernel expects for it.
        unsafe { v4l2::ioctl(self.fd, request, arg as *mut T as *mut c_void) }
    }

    fn set_frame_rate(&mut self, fps: u32) -> io::Result<u32> {
        let params = self.device.set_params(&Parameters::with_fps(fps))?;
        if params.interval.numerator == 0 {
            return Ok(fps);
        }
        Ok(params.interval.denominator / params.interval.numerator)
    }
}

fn set_nonblocking(fd: c_int) -> io::Result<()> {
    // SAFETY: plain fcntl calls on a descriptor owned by the open device.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn capture_buffer(index: u32) -> v4l2_buffer {
    v4l2_buffer {
        index,
        type_: Type::VideoCapture as u32,
        memory: Memory::Mmap as u32,
        // SAFETY: v4l2_buffer is plain data; all-zero bytes are a valid value.
        ..unsafe { mem::zeroed() }
    }
}

impl CaptureDevice for V4l2Device {
    fn name(&self) -> &str {
        &self.path
    }

    fn negotiate(&mut self, requested: CaptureFormat) -> io::Result<CaptureFormat> {
        let wanted = Format::new(requested.width, requested.height, FourCC::new(MJPEG));
        let format = self.device.set_format(&wanted)?;
        if format.fourcc != FourCC::new(MJPEG) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{} does not support MJPEG capture", self.path),
            ));
        }

        let fps = match self.set_frame_rate(requested.fps.max(1)) {
            Ok(fps) => fps,
            Err(err) => {
                log::warn!("V4l2Device: failed to set fps on {}: {}", self.path, err);
                requested.fps
            }
        };

        Ok(CaptureFormat {
            width: format.width,
            height: format.height,
            fps,
        })
    }

    fn set_control(&mut self, id: u32, value: i32) -> io::Result<()> {
        self.device.set_control(Control {
            id,
            value: Value::Integer(i64::from(value)),
        })
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let mut request = v4l2_requestbuffers {
            count,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: plain data, zero is valid.
            ..unsafe { mem::zeroed() }
        };
        self.ioctl(vidioc::VIDIOC_REQBUFS, &mut request)?;
        Ok(request.count)
    }

    fn map_buffer(&mut self, index: u32) -> io::Result<MappedRegion> {
        let mut buffer = capture_buffer(index);
        self.ioctl(vidioc::VIDIOC_QUERYBUF, &mut buffer)?;
        let len = buffer.length as usize;
        // SAFETY: QUERYBUF on an MMAP buffer fills the offset member.
        let offset = unsafe { buffer.m.offset };
        // SAFETY: maps a driver-provided buffer; the result is checked below.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        // SAFETY: the mapping is valid for `len` bytes until unmap_buffer.
        Ok(unsafe { MappedRegion::new(ptr, len) })
    }

    fn unmap_buffer(&mut self, region: MappedRegion) -> io::Result<()> {
        // SAFETY: the region came from map_buffer and is unmapped once.
        let rc = unsafe { libc::munmap(region.as_ptr() as *mut libc::c_void, region.len()) };
        if rc == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let mut buffer = capture_buffer(index);
        self.ioctl(vidioc::VIDIOC_QBUF, &mut buffer)
    }

    fn dequeue_buffer(&mut self) -> io::Result<FilledBuffer> {
        let mut buffer = capture_buffer(0);
        self.ioctl(vidioc::VIDIOC_DQBUF, &mut buffer)?;
        Ok(FilledBuffer {
            index: buffer.index,
            bytes_used: buffer.bytesused,
            sequence: buffer.sequence,
            timestamp: FrameTimestamp::new(
                buffer.timestamp.tv_sec as i64,
                buffer.timestamp.tv_usec as i64,
            ),
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut kind = Type::VideoCapture as u32;
        self.ioctl(vidioc::VIDIOC_STREAMON, &mut kind)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut kind = Type::VideoCapture as u32;
        self.ioctl(vidioc::VIDIOC_STREAMOFF, &mut kind)
    }
}
