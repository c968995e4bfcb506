use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use nix::{errno::Errno as HostErrno, sys::uio::pread};
use ulmm_hal::mem::{PageTableEditor, PteFlags, VirtAddr};

use super::{FaultChannel, FaultEvent, Region};
use crate::{
    Errno, Result, fatal,
    pool::{PagePool, PoolPage},
};

/// Fill byte of an anonymous page resolved by the `fault_number`-th fault
/// of its region: `A` for the first, `B` for the second, wrapping after `Z`.
pub fn anonymous_fill(fault_number: usize) -> u8 {
    b'A' + (fault_number.saturating_sub(1) % 26) as u8
}

/// Start the handler thread of `region`. A handler error terminates the process.
pub(super) fn spawn<C, E>(
    region: Arc<Region<C>>,
    pool: Arc<PagePool>,
    editor: Arc<E>,
) -> Result<JoinHandle<()>>
where
    C: FaultChannel,
    E: PageTableEditor + 'static,
{
    let name = format!("ulmm-fault-{:#x}", region.base());
    let handle = thread::Builder::new().name(name).spawn(move || {
        let handler = FaultHandler {
            region,
            pool,
            editor,
        };
        if let Err(err) = handler.serve() {
            fatal("fault handler", err);
        }
    })?;
    Ok(handle)
}

pub(super) struct FaultHandler<C, E> {
    pub(super) region: Arc<Region<C>>,
    pub(super) pool: Arc<PagePool>,
    pub(super) editor: Arc<E>,
}

impl<C: FaultChannel, E: PageTableEditor> FaultHandler<C, E> {
    pub(super) fn serve(&self) -> Result<()> {
        let base = self.region.base();
        log::debug!("fault handler for {:#x} started", base);

        while !self.region.is_stopped() {
            match self.region.channel().wait()? {
                None => break,
                Some(FaultEvent::MissingPage { addr }) => self.resolve(addr)?,
                Some(FaultEvent::Unexpected(kind)) => {
                    return Err(Errno::Protocol.with_message(format!(
                        "unexpected {} event on region {:#x}",
                        kind, base
                    )));
                }
            }
        }

        log::debug!("fault handler for {:#x} stopped", base);
        Ok(())
    }

    pub(super) fn resolve(&self, addr: VirtAddr) -> Result<()> {
        let region = &self.region;
        if !region.contains(addr) {
            return Err(Errno::Protocol.with_message(format!(
                "fault at {:#x} outside region {:#x}..{:#x}",
                addr,
                region.base(),
                region.end()
            )));
        }

        let page_size = region.page_size();
        let page_addr = page_size.align_down(addr);
        let index = region.page_index(page_addr);

        let Some(mut page) = self.obtain_page() else {
            return Ok(());
        };
        let fault_number = region.record_fault();
        if let Err(err) = self.fill(&mut page, index, fault_number) {
            self.pool.deallocate(page);
            return Err(err);
        }

        let frame = self.editor.read_frame(self.pool.page_addr(&page))?;
        self.editor
            .install_frame(page_addr, frame, PteFlags::user_data())?;
        log::trace!(
            "fault #{} at {:#x}: page {} -> frame {}",
            fault_number,
            addr,
            index,
            frame.index()
        );

        if let Some(previous) = region.install_page(index, page) {
            self.pool.deallocate(previous);
        }
        region.channel().wake(page_addr, page_size.bytes())
    }

    /// Spin on the pool until a page frees up or the region is stopped.
    fn obtain_page(&self) -> Option<PoolPage> {
        let mut warned = false;
        loop {
            if let Some(page) = self.pool.allocate() {
                return Some(page);
            }
            if self.region.is_stopped() {
                return None;
            }
            if !warned {
                log::warn!(
                    "page pool exhausted, region {:#x} waits for a free page",
                    self.region.base()
                );
                warned = true;
            }
            thread::yield_now();
        }
    }

    fn fill(&self, page: &mut PoolPage, index: usize, fault_number: usize) -> Result<()> {
        let page_size = self.region.page_size().bytes();
        let bytes = self.pool.page_bytes_mut(page);

        let Some(backing) = self.region.backing() else {
            bytes.fill(anonymous_fill(fault_number));
            return Ok(());
        };

        let offset = backing.offset + (index * page_size) as u64;
        let mut filled = 0;
        while filled < bytes.len() {
            match pread(&backing.fd, &mut bytes[filled..], (offset + filled as u64) as _) {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(HostErrno::EINTR) => continue,
                Err(err) => {
                    return Err(Errno::Io.with_message(format!(
                        "read backing page {} at offset {:#x}: {}",
                        index, offset, err
                    )));
                }
            }
        }
        bytes[filled..].fill(0);
        Ok(())
    }
}
