//! Dongle device discovery and serial I/O.
//!
//! Discovery and opening sit behind the [`DongleIo`] trait so the lifecycle
//! supervisor never touches the OS directly; production uses
//! [`UsbDongleIo`] over the `serialport` crate, tests substitute the fake
//! in [`crate::testing`].

use std::io::{self, Read, Write};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use tracing::debug;

use botlink_core::{DevicePath, SERIAL_BAUD};

/// USB vendor id of the radio dongle.
pub const DONGLE_USB_VID: u16 = 0x03eb;

/// USB product id of the radio dongle.
pub const DONGLE_USB_PID: u16 = 0x204d;

/// Environment override for the dongle device path, for machines whose
/// dongle enumerates with unexpected ids.
pub const DONGLE_PATH_ENV: &str = "BOTLINK_DONGLE";

/// Any async byte stream the framing layer can run over.
pub trait AsyncByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncByteStream for T {}

/// An opened dongle byte stream.
pub type DongleStream = Box<dyn AsyncByteStream>;

/// Seam between the lifecycle supervisor and the operating system.
pub trait DongleIo: Send + Sync + 'static {
    /// Where the dongle's serial device currently lives, if anywhere.
    fn find_dongle_path(&self) -> Option<DevicePath>;

    /// Open the device as a raw byte stream.
    fn open(&self, path: &DevicePath) -> io::Result<DongleStream>;
}

/// Query the operating system for the dongle's serial device, e.g.
/// `/dev/ttyACM0` or `\\.\COM3`.
pub fn find_dongle_path() -> Option<DevicePath> {
    UsbDongleIo.find_dongle_path()
}

/// Production dongle access: USB enumeration plus a serial port opened at
/// the dongle's baud rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsbDongleIo;

impl DongleIo for UsbDongleIo {
    fn find_dongle_path(&self) -> Option<DevicePath> {
        if let Ok(path) = std::env::var(DONGLE_PATH_ENV) {
            if !path.is_empty() {
                return Some(DevicePath::new(path));
            }
        }
        let ports = serialport::available_ports().ok()?;
        ports.into_iter().find_map(|info| match info.port_type {
            SerialPortType::UsbPort(usb)
                if usb.vid == DONGLE_USB_VID && usb.pid == DONGLE_USB_PID =>
            {
                Some(DevicePath::new(info.port_name))
            }
            _ => None,
        })
    }

    fn open(&self, path: &DevicePath) -> io::Result<DongleStream> {
        Ok(Box::new(SerialStream::open(path, SERIAL_BAUD)?))
    }
}

/// Bridges a blocking `serialport` handle onto the async world.
///
/// One thread blocks in `read` and feeds a channel, one drains a channel
/// into `write`. A write error is latched and surfaced on the next
/// `poll_write`, which is what makes the keepalive write trap work: on some
/// OS serial drivers a removed USB device never errors the read side.
pub(crate) struct SerialStream {
    incoming: mpsc::Receiver<io::Result<Vec<u8>>>,
    pending: Vec<u8>,
    outgoing: PollSender<Vec<u8>>,
    write_fault: Arc<Mutex<Option<(io::ErrorKind, String)>>>,
}

impl SerialStream {
    pub(crate) fn open(path: &DevicePath, baud: u32) -> io::Result<Self> {
        let port = serialport::new(path.as_str(), baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(200))
            .open()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let reader = port
            .try_clone()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        debug!(path = %path, baud, "opened dongle serial device");
        Ok(Self::bridge(reader, port))
    }

    fn bridge(mut reader: Box<dyn SerialPort>, mut writer: Box<dyn SerialPort>) -> Self {
        let (in_tx, incoming) = mpsc::channel::<io::Result<Vec<u8>>>(32);
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(32);
        let write_fault = Arc::new(Mutex::new(None));
        let fault = Arc::clone(&write_fault);

        std::thread::spawn(move || {
            let mut buf = [0u8; 256];
            loop {
                if in_tx.is_closed() {
                    return;
                }
                match reader.read(&mut buf) {
                    Ok(0) => {
                        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
                        let _ = in_tx.blocking_send(Err(eof));
                        return;
                    }
                    Ok(n) => {
                        if in_tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                            return;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                    Err(e) => {
                        let _ = in_tx.blocking_send(Err(e));
                        return;
                    }
                }
            }
        });

        std::thread::spawn(move || {
            while let Some(chunk) = out_rx.blocking_recv() {
                if let Err(e) = writer.write_all(&chunk).and_then(|()| writer.flush()) {
                    let mut slot = fault.lock().expect("serial write fault mutex poisoned");
                    *slot = Some((e.kind(), e.to_string()));
                    return;
                }
            }
        });

        Self {
            incoming,
            pending: Vec::new(),
            outgoing: PollSender::new(out_tx),
            write_fault,
        }
    }

    fn take_write_fault(&self) -> Option<io::Error> {
        let slot = self.write_fault.lock().expect("serial write fault mutex poisoned");
        slot.as_ref().map(|(kind, msg)| io::Error::new(*kind, msg.clone()))
    }
}

impl AsyncRead for SerialStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.drain(..n);
                return Poll::Ready(Ok(()));
            }
            match this.incoming.poll_recv(cx) {
                Poll::Ready(Some(Ok(data))) => this.pending = data,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                // Reader thread gone: surface end-of-stream.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for SerialStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(fault) = this.take_write_fault() {
            return Poll::Ready(Err(fault));
        }
        match this.outgoing.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                if this.outgoing.send_item(data.to_vec()).is_err() {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                Poll::Ready(Ok(data.len()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // The writer thread flushes after every chunk.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().outgoing.close();
        Poll::Ready(Ok(()))
    }
}
