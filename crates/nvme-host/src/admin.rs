//! Synchronous admin commands over the admin queue pair.
//!
//! Every call builds one command, submits it, and spin-polls the admin queue
//! pair until the completion callback has run. Data moves through a DMA
//! bounce buffer that is owned by the callback, so a command that outlives
//! its caller (timeout) never leaves the device writing into freed memory.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::command::{admin_opcode, Command, Completion};
use crate::identify::{
    parse_namespace_list, IdentifyController, IdentifyNamespace, CNS_ACTIVE_NAMESPACE_LIST,
    CNS_CONTROLLER, CNS_NAMESPACE, IDENTIFY_DATA_SIZE,
};
use crate::log_page::feature_id;
use crate::options::QueuePriority;
use crate::platform::{Clock, DmaBuffer};
use crate::qpair::QueuePair;
use crate::request::{Payload, Request};
use crate::{Error, Result};

/// Data phase of a raw admin command.
#[derive(Debug)]
pub enum AdminData<'a> {
    None,
    ToDevice(&'a [u8]),
    FromDevice(&'a mut [u8]),
}

/// Secure erase setting of Format NVM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecureErase {
    #[default]
    None = 0,
    UserData = 1,
    Cryptographic = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatParams {
    /// LBA format index.
    pub lbaf: u8,
    /// Metadata transferred inline with the data (extended LBA).
    pub extended_metadata: bool,
    /// Protection information type, 0 to disable.
    pub pi: u8,
    /// Protection information in the first bytes of metadata.
    pub pi_first: bool,
    pub secure_erase: SecureErase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAction {
    /// Store the downloaded image in the slot.
    Replace = 0,
    /// Store and activate at the next reset.
    ReplaceAndActivate = 1,
    /// Activate the image already in the slot at the next reset.
    Activate = 2,
    ReplaceAndActivateNow = 3,
}

pub const ALL_NAMESPACES: u32 = 0xffff_ffff;

const NS_MGMT_CREATE: u32 = 0;
const NS_MGMT_DELETE: u32 = 1;
const NS_ATTACH: u32 = 0;
const NS_DETACH: u32 = 1;

pub(crate) fn identify_command(cns: u8, nsid: u32) -> Command {
    let mut cmd = Command::new(admin_opcode::IDENTIFY).with_nsid(nsid);
    cmd.cdw10 = cns as u32;
    cmd
}

pub(crate) fn get_log_page_command(lid: u8, nsid: u32, len: usize) -> Command {
    let numd = (len / 4 - 1) as u32;
    let mut cmd = Command::new(admin_opcode::GET_LOG_PAGE).with_nsid(nsid);
    cmd.cdw10 = lid as u32 | (numd & 0xffff) << 16;
    cmd.cdw11 = numd >> 16;
    cmd
}

pub(crate) fn create_io_cq_command(qid: u16, entries: u16, bus: u64) -> Command {
    let mut cmd = Command::new(admin_opcode::CREATE_IO_CQ);
    cmd.prp1 = bus;
    cmd.cdw10 = qid as u32 | (entries as u32 - 1) << 16;
    // Physically contiguous, interrupts disabled.
    cmd.cdw11 = 1;
    cmd
}

pub(crate) fn create_io_sq_command(
    qid: u16,
    entries: u16,
    bus: u64,
    cqid: u16,
    priority: QueuePriority,
) -> Command {
    let mut cmd = Command::new(admin_opcode::CREATE_IO_SQ);
    cmd.prp1 = bus;
    cmd.cdw10 = qid as u32 | (entries as u32 - 1) << 16;
    cmd.cdw11 = 1 | (priority as u32) << 1 | (cqid as u32) << 16;
    cmd
}

pub(crate) fn format_command(nsid: u32, params: &FormatParams) -> Command {
    let mut cmd = Command::new(admin_opcode::FORMAT_NVM).with_nsid(nsid);
    cmd.cdw10 = (params.lbaf as u32 & 0xf)
        | (params.extended_metadata as u32) << 4
        | (params.pi as u32 & 0x7) << 5
        | (params.pi_first as u32) << 8
        | (params.secure_erase as u32) << 9;
    cmd
}

pub(crate) fn firmware_commit_command(slot: u8, action: CommitAction) -> Command {
    let mut cmd = Command::new(admin_opcode::FIRMWARE_COMMIT);
    cmd.cdw10 = (slot as u32 & 0x7) | (action as u32) << 3;
    cmd
}

pub(crate) fn abort_command(sqid: u16, cid: u16) -> Command {
    let mut cmd = Command::new(admin_opcode::ABORT);
    cmd.cdw10 = sqid as u32 | (cid as u32) << 16;
    cmd
}

type AdminResult = (Completion, Option<Vec<u8>>);

/// Admin command executor bound to the admin queue pair.
pub(crate) struct Admin<'a> {
    pub qpair: &'a QueuePair,
    pub clock: &'a dyn Clock,
    pub timeout: Option<Duration>,
}

impl Admin<'_> {
    /// Runs `cmd` to completion. An error status becomes [`Error::Command`].
    pub fn execute(&self, cmd: Command, mut data: AdminData<'_>) -> Result<Completion> {
        let (len, read_back) = match &data {
            AdminData::None => (0, false),
            AdminData::ToDevice(bytes) => (bytes.len(), false),
            AdminData::FromDevice(buf) => (buf.len(), true),
        };

        let mut req = Request::new(cmd);
        let buffer = if len > 0 {
            let buffer = DmaBuffer::alloc(self.qpair.memory(), len, self.qpair.page_size() as usize)?;
            if let AdminData::ToDevice(bytes) = &data {
                buffer.write(0, bytes);
            }
            req = req.with_payload(Payload::Contiguous(buffer.region().vaddr), len);
            Some(buffer)
        } else {
            None
        };

        let slot: Arc<Mutex<Option<AdminResult>>> = Arc::new(Mutex::new(None));
        let done = Arc::clone(&slot);
        let req = req.on_complete(move |cpl| {
            let bytes = match &buffer {
                Some(buffer) if read_back => Some(buffer.to_vec()),
                _ => None,
            };
            drop(buffer);
            *done.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some((*cpl, bytes));
        });
        self.qpair.submit(req)?;

        let start = self.clock.now();
        let (cpl, bytes) = loop {
            self.qpair.poll(0);
            if let Some(result) = slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take()
            {
                break result;
            }
            if let Some(timeout) = self.timeout {
                if self.clock.now().saturating_sub(start) > timeout {
                    tracing::warn!(opc = cmd.opc, "admin command timed out");
                    return Err(Error::Timeout("admin command"));
                }
            }
            std::hint::spin_loop();
        };

        if let (AdminData::FromDevice(out), Some(bytes)) = (&mut data, bytes) {
            let n = out.len().min(bytes.len());
            out[..n].copy_from_slice(&bytes[..n]);
        }
        if cpl.status.is_error() {
            return Err(Error::Command(cpl.status));
        }
        Ok(cpl)
    }

    fn identify(&self, cns: u8, nsid: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; IDENTIFY_DATA_SIZE];
        self.execute(identify_command(cns, nsid), AdminData::FromDevice(&mut buf))?;
        Ok(buf)
    }

    pub fn identify_controller(&self) -> Result<IdentifyController> {
        Ok(IdentifyController::parse(&self.identify(CNS_CONTROLLER, 0)?))
    }

    pub fn identify_namespace(&self, nsid: u32) -> Result<IdentifyNamespace> {
        Ok(IdentifyNamespace::parse(&self.identify(CNS_NAMESPACE, nsid)?))
    }

    /// Active namespace ids greater than `start`, up to 1024 of them.
    pub fn active_namespaces(&self, start: u32) -> Result<Vec<u32>> {
        Ok(parse_namespace_list(&self.identify(CNS_ACTIVE_NAMESPACE_LIST, start)?))
    }

    /// Returns completion dword 0.
    pub fn get_features(&self, fid: u8, cdw11: u32, data: Option<&mut [u8]>) -> Result<u32> {
        let mut cmd = Command::new(admin_opcode::GET_FEATURES);
        cmd.cdw10 = fid as u32;
        cmd.cdw11 = cdw11;
        let data = match data {
            Some(buf) => AdminData::FromDevice(buf),
            None => AdminData::None,
        };
        Ok(self.execute(cmd, data)?.cdw0)
    }

    pub fn set_features(
        &self,
        fid: u8,
        cdw11: u32,
        cdw12: u32,
        data: Option<&[u8]>,
    ) -> Result<u32> {
        let mut cmd = Command::new(admin_opcode::SET_FEATURES);
        cmd.cdw10 = fid as u32;
        cmd.cdw11 = cdw11;
        cmd.cdw12 = cdw12;
        let data = match data {
            Some(bytes) => AdminData::ToDevice(bytes),
            None => AdminData::None,
        };
        Ok(self.execute(cmd, data)?.cdw0)
    }

    /// Requests `count` I/O submission and completion queues. Returns the
    /// number of each the controller allocated.
    pub fn set_num_queues(&self, count: u32) -> Result<(u32, u32)> {
        let n = count.clamp(1, 0xffff) - 1;
        let cdw0 = self.set_features(feature_id::NUMBER_OF_QUEUES, n | n << 16, 0, None)?;
        Ok(((cdw0 & 0xffff) + 1, (cdw0 >> 16) + 1))
    }

    pub fn create_io_cq(&self, qid: u16, entries: u16, bus: u64) -> Result<()> {
        self.execute(create_io_cq_command(qid, entries, bus), AdminData::None)?;
        tracing::debug!(qid, entries, "created I/O completion queue");
        Ok(())
    }

    pub fn create_io_sq(
        &self,
        qid: u16,
        entries: u16,
        bus: u64,
        cqid: u16,
        priority: QueuePriority,
    ) -> Result<()> {
        self.execute(create_io_sq_command(qid, entries, bus, cqid, priority), AdminData::None)?;
        tracing::debug!(qid, entries, ?priority, "created I/O submission queue");
        Ok(())
    }

    pub fn delete_io_sq(&self, qid: u16) -> Result<()> {
        let mut cmd = Command::new(admin_opcode::DELETE_IO_SQ);
        cmd.cdw10 = qid as u32;
        self.execute(cmd, AdminData::None)?;
        tracing::debug!(qid, "deleted I/O submission queue");
        Ok(())
    }

    pub fn delete_io_cq(&self, qid: u16) -> Result<()> {
        let mut cmd = Command::new(admin_opcode::DELETE_IO_CQ);
        cmd.cdw10 = qid as u32;
        self.execute(cmd, AdminData::None)?;
        tracing::debug!(qid, "deleted I/O completion queue");
        Ok(())
    }

    pub fn get_log_page(&self, lid: u8, nsid: u32, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() || buf.len() % 4 != 0 {
            return Err(Error::InvalidArgument("log page length must be a non-zero multiple of 4"));
        }
        self.execute(get_log_page_command(lid, nsid, buf.len()), AdminData::FromDevice(buf))?;
        Ok(())
    }

    pub fn format(&self, nsid: u32, params: &FormatParams) -> Result<()> {
        self.execute(format_command(nsid, params), AdminData::None)?;
        Ok(())
    }

    /// Downloads `image` in pieces of at most `chunk` bytes.
    pub fn firmware_download(&self, image: &[u8], chunk: usize) -> Result<()> {
        if image.is_empty() || image.len() % 4 != 0 {
            return Err(Error::InvalidArgument("firmware image size must be a non-zero multiple of 4"));
        }
        let chunk = (chunk & !3).max(4);
        for (i, piece) in image.chunks(chunk).enumerate() {
            let mut cmd = Command::new(admin_opcode::FIRMWARE_IMAGE_DOWNLOAD);
            cmd.cdw10 = (piece.len() / 4 - 1) as u32;
            cmd.cdw11 = (i * chunk / 4) as u32;
            self.execute(cmd, AdminData::ToDevice(piece))?;
        }
        Ok(())
    }

    pub fn firmware_commit(&self, slot: u8, action: CommitAction) -> Result<Completion> {
        self.execute(firmware_commit_command(slot, action), AdminData::None)
    }

    /// Returns true when the controller reports the command as aborted.
    pub fn abort(&self, sqid: u16, cid: u16) -> Result<bool> {
        let cpl = self.execute(abort_command(sqid, cid), AdminData::None)?;
        Ok(cpl.cdw0 & 1 == 0)
    }

    /// Creates a namespace from `template` and returns its id.
    pub fn create_namespace(&self, template: &IdentifyNamespace) -> Result<u32> {
        let mut cmd = Command::new(admin_opcode::NS_MANAGEMENT);
        cmd.cdw10 = NS_MGMT_CREATE;
        Ok(self.execute(cmd, AdminData::ToDevice(&template.to_bytes()))?.cdw0)
    }

    pub fn delete_namespace(&self, nsid: u32) -> Result<()> {
        let mut cmd = Command::new(admin_opcode::NS_MANAGEMENT).with_nsid(nsid);
        cmd.cdw10 = NS_MGMT_DELETE;
        self.execute(cmd, AdminData::None)?;
        Ok(())
    }

    pub fn namespace_attachment(&self, nsid: u32, controllers: &[u16], attach: bool) -> Result<()> {
        if controllers.is_empty() || controllers.len() > 2047 {
            return Err(Error::InvalidArgument("controller list must hold 1 to 2047 entries"));
        }
        let mut list = vec![0u8; IDENTIFY_DATA_SIZE];
        list[0..2].copy_from_slice(&(controllers.len() as u16).to_le_bytes());
        for (i, id) in controllers.iter().enumerate() {
            list[2 + i * 2..4 + i * 2].copy_from_slice(&id.to_le_bytes());
        }
        let mut cmd = Command::new(admin_opcode::NS_ATTACHMENT).with_nsid(nsid);
        cmd.cdw10 = if attach { NS_ATTACH } else { NS_DETACH };
        self.execute(cmd, AdminData::ToDevice(&list))?;
        Ok(())
    }
}
