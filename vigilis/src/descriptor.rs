//! Resolution of watched handles to OS descriptor numbers.

use std::fs::File;
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixDatagram, UnixListener, UnixStream};
use std::process::{ChildStderr, ChildStdin, ChildStdout};

/// Anything that can name the descriptor a queue should watch.
///
/// The number must stay stable for as long as the descriptor is registered.
pub trait AsDescriptor {
    fn descriptor(&self) -> RawFd;
}

impl AsDescriptor for RawFd {
    #[inline]
    fn descriptor(&self) -> RawFd {
        *self
    }
}

impl<D: AsDescriptor + ?Sized> AsDescriptor for &D {
    #[inline]
    fn descriptor(&self) -> RawFd {
        (**self).descriptor()
    }
}

macro_rules! as_descriptor_via_raw_fd {
    ($($ty:ty),* $(,)?) => {
        $(
            impl AsDescriptor for $ty {
                #[inline]
                fn descriptor(&self) -> RawFd {
                    self.as_raw_fd()
                }
            }
        )*
    };
}

as_descriptor_via_raw_fd!(
    BorrowedFd<'_>,
    OwnedFd,
    File,
    TcpListener,
    TcpStream,
    UdpSocket,
    UnixDatagram,
    UnixListener,
    UnixStream,
    ChildStdin,
    ChildStdout,
    ChildStderr,
);
