//! Fault delegation through the host's userfaultfd.

use std::{
    ffi::c_void,
    os::fd::{AsFd, AsRawFd, BorrowedFd},
};

use nix::{
    errno::Errno as HostErrno,
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::eventfd::{EfdFlags, EventFd},
};
use userfaultfd::{Event, Uffd, UffdBuilder};
use ulmm_hal::{
    mem::VirtAddr,
    vm::{self, Protection},
};

use super::{FaultChannel, FaultDelegation, FaultEvent};
use crate::{Errno, Result};

/// Reserves private anonymous ranges and registers them for missing-page
/// faults, one userfaultfd per region.
#[derive(Debug, Default, Clone, Copy)]
pub struct UffdDelegation;

impl FaultDelegation for UffdDelegation {
    type Channel = UffdChannel;

    fn reserve(&self, hint: Option<VirtAddr>, len: usize, prot: Protection) -> Result<VirtAddr> {
        vm::reserve_anonymous(hint, len, prot)
    }

    fn register(&self, base: VirtAddr, len: usize) -> Result<UffdChannel> {
        UffdChannel::open(base, len)
    }

    fn release(&self, base: VirtAddr, len: usize) -> Result<()> {
        unsafe { vm::release(base, len) }
    }
}

/// A non-blocking userfaultfd paired with an eventfd used to stop the waiter.
pub struct UffdChannel {
    uffd: Uffd,
    stop: EventFd,
}

impl UffdChannel {
    fn open(base: VirtAddr, len: usize) -> Result<Self> {
        let uffd = UffdBuilder::new()
            .close_on_exec(true)
            .non_blocking(true)
            .create()
            .map_err(|err| Errno::RegisterFailed.with_message(format!("userfaultfd: {err}")))?;
        uffd.register(base as *mut c_void, len).map_err(|err| {
            Errno::RegisterFailed.with_message(format!(
                "register {:#x}..{:#x}: {}",
                base,
                base + len,
                err
            ))
        })?;
        let stop = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC)
            .map_err(|err| Errno::RegisterFailed.with_message(format!("eventfd: {err}")))?;
        Ok(Self { uffd, stop })
    }

    fn uffd_fd(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.uffd.as_raw_fd()) }
    }
}

fn describe(event: &Event) -> &'static str {
    #[allow(unreachable_patterns)]
    match event {
        Event::Pagefault { .. } => "pagefault",
        Event::Fork { .. } => "fork",
        Event::Remap { .. } => "remap",
        Event::Remove { .. } => "remove",
        Event::Unmap { .. } => "unmap",
        _ => "unknown",
    }
}

impl FaultChannel for UffdChannel {
    fn wait(&self) -> Result<Option<FaultEvent>> {
        loop {
            let mut fds = [
                PollFd::new(self.uffd_fd(), PollFlags::POLLIN),
                PollFd::new(self.stop.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(HostErrno::EINTR) => continue,
                Err(err) => {
                    return Err(Errno::Io.with_message(format!("poll userfaultfd: {err}")));
                }
            }

            let stop = fds[1].revents().unwrap_or(PollFlags::empty());
            if stop.contains(PollFlags::POLLIN) {
                return Ok(None);
            }

            let revents = fds[0].revents().unwrap_or(PollFlags::empty());
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                return Err(Errno::Protocol.with_message(format!(
                    "userfaultfd reported {:?}",
                    revents
                )));
            }
            if !revents.contains(PollFlags::POLLIN) {
                continue;
            }

            let event = self
                .uffd
                .read_event()
                .map_err(|err| Errno::Io.with_message(format!("read userfaultfd event: {err}")))?;
            match event {
                Some(Event::Pagefault { addr, .. }) => {
                    return Ok(Some(FaultEvent::MissingPage {
                        addr: addr as VirtAddr,
                    }));
                }
                Some(other) => return Ok(Some(FaultEvent::Unexpected(describe(&other).into()))),
                // Another reader won the race for this event.
                None => continue,
            }
        }
    }

    fn wake(&self, page: VirtAddr, len: usize) -> Result<()> {
        self.uffd
            .wake(page as *mut c_void, len)
            .map_err(|err| Errno::Io.with_message(format!("wake {:#x}: {}", page, err)))
    }

    fn stop(&self) -> Result<()> {
        self.stop
            .write(1)
            .map(drop)
            .map_err(|err| Errno::Io.with_message(format!("signal handler stop: {err}")))
    }

    fn unregister(&self, base: VirtAddr, len: usize) -> Result<()> {
        self.uffd.unregister(base as *mut c_void, len).map_err(|err| {
            Errno::RegisterFailed.with_message(format!("unregister {:#x}: {}", base, err))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, os::fd::AsFd};

    use ulmm_hal::mem::{PageSize, ShmPageTable, host_page_size};

    use super::*;
    use crate::{
        engine::{Backing, Engine, EngineOptions, MapKind, anonymous_fill},
        pool::PoolOptions,
    };

    /// Hosts without userfaultfd permission skip the test.
    fn host_engine() -> Option<Engine<UffdDelegation, ShmPageTable>> {
        if host_page_size() != PageSize::Size4K.bytes() || UffdBuilder::new().create().is_err() {
            eprintln!("userfaultfd unavailable, skipping");
            return None;
        }
        let options =
            EngineOptions::new().pool(PoolOptions::new().shards(2).pages_per_shard(16));
        Some(Engine::new_host(options).unwrap())
    }

    #[test]
    fn anonymous_fault_installs_pool_frame() {
        let Some(engine) = host_engine() else { return };
        let page = PageSize::Size4K.bytes();
        let prot = Protection::READ | Protection::WRITE;

        let base = engine
            .try_map(None, 4 * page, prot, MapKind::PRIVATE | MapKind::ANONYMOUS, None)
            .unwrap();
        let byte = unsafe { vm::touch_page(base + 2 * page + 0x10) };
        assert_eq!(byte, anonymous_fill(1));
        assert_eq!(engine.fault_count(base), Some(1));

        // Writes land in the pool frame.
        unsafe { *((base + 2 * page + 0x20) as *mut u8) = 0x77 };
        let region = engine.lookup(base).unwrap();
        assert_eq!(region.resident_pages(), 1);

        engine.unmap(base, 4 * page).unwrap();
        assert_eq!(engine.live_regions(), 0);
        assert!(region.handler_joined());
        assert_eq!(engine.pool().free_pages(), engine.pool().total_pages());
    }

    #[test]
    fn file_fault_reads_backing() {
        let Some(engine) = host_engine() else { return };
        let page = PageSize::Size4K.bytes();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![3u8; page]).unwrap();
        file.write_all(&vec![9u8; 100]).unwrap();

        let base = engine
            .try_map(
                None,
                2 * page,
                Protection::READ,
                MapKind::PRIVATE | MapKind::FILE,
                Some(Backing::new(file.as_fd(), 0)),
            )
            .unwrap();
        assert_eq!(unsafe { vm::touch_page(base + 5) }, 3);
        assert_eq!(unsafe { vm::touch_page(base + page + 99) }, 9);
        assert_eq!(unsafe { vm::touch_page(base + page + 100) }, 0);
        assert_eq!(engine.fault_count(base), Some(2));

        engine.unmap(base, 2 * page).unwrap();
    }
}
