//! Thin safe wrapper over libibverbs.
//!
//! The transport needs shared receive queues and two-segment gather sends,
//! so this module drives the verbs API directly through `ibverbs-sys` and
//! exposes exactly the primitives the transport uses: open a device,
//! allocate a protection domain, create SRQs / CQs / RC queue pairs,
//! register memory, post work requests, and poll completions.
//!
//! Every creation failure here is fatal to transport construction.

use std::ffi::CStr;
use std::io;
use std::mem;
use std::ptr;

use ibverbs_sys as ffi;
use tracing::debug;

use crate::error::{Error, Result};
use crate::wire::QueuePairTuple;

/// One polled work completion.
///
/// Layout-compatible with `struct ibv_wc` so completion arrays can be handed
/// straight to the driver.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: u32,
    pub opcode: u32,
    pub vendor_err: u32,
    pub byte_len: u32,
    pub imm_data: u32,
    pub qp_num: u32,
    pub src_qp: u32,
    pub wc_flags: u32,
    pub pkey_index: u16,
    pub slid: u16,
    pub sl: u8,
    pub dlid_path_bits: u8,
}

impl WorkCompletion {
    pub fn zeroed() -> Self {
        // Safety: all-zero bytes are a valid value for every field.
        unsafe { mem::zeroed() }
    }

    /// The `wr_id` stashed when the work request was posted.
    pub fn wr_id(&self) -> u64 {
        self.wr_id
    }

    /// Local queue pair number the completion belongs to.
    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    /// Bytes transferred, for receive completions.
    pub fn byte_len(&self) -> u32 {
        self.byte_len
    }

    pub fn is_success(&self) -> bool {
        self.status == ffi::ibv_wc_status::IBV_WC_SUCCESS
    }

    /// Human-readable completion status.
    pub fn status_str(&self) -> &'static str {
        wc_status_str(self.status)
    }
}

fn wc_status_str(status: u32) -> &'static str {
    use ffi::ibv_wc_status as s;
    match status {
        s::IBV_WC_SUCCESS => "IBV_WC_SUCCESS",
        s::IBV_WC_LOC_LEN_ERR => "IBV_WC_LOC_LEN_ERR",
        s::IBV_WC_LOC_QP_OP_ERR => "IBV_WC_LOC_QP_OP_ERR",
        s::IBV_WC_LOC_PROT_ERR => "IBV_WC_LOC_PROT_ERR",
        s::IBV_WC_WR_FLUSH_ERR => "IBV_WC_WR_FLUSH_ERR",
        s::IBV_WC_REM_ACCESS_ERR => "IBV_WC_REM_ACCESS_ERR",
        s::IBV_WC_REM_OP_ERR => "IBV_WC_REM_OP_ERR",
        s::IBV_WC_REM_INV_REQ_ERR => "IBV_WC_REM_INV_REQ_ERR",
        s::IBV_WC_RETRY_EXC_ERR => "IBV_WC_RETRY_EXC_ERR",
        s::IBV_WC_RNR_RETRY_EXC_ERR => "IBV_WC_RNR_RETRY_EXC_ERR",
        s::IBV_WC_RESP_TIMEOUT_ERR => "IBV_WC_RESP_TIMEOUT_ERR",
        _ => "IBV_WC_<unknown>",
    }
}

fn setup_err(what: &str) -> Error {
    Error::Setup(format!("{what}: {}", io::Error::last_os_error()))
}

/// An open HCA with its protection domain.
pub struct Hca {
    ctx: *mut ffi::ibv_context,
    pd: *mut ffi::ibv_pd,
}

impl Hca {
    /// Open a device by name, or the first available device when `device`
    /// is `None`, and allocate a protection domain on it.
    pub fn open(device: Option<&str>) -> Result<Self> {
        // Safety: verbs device enumeration; the list is freed before return.
        unsafe {
            let mut count = 0i32;
            let list = ffi::ibv_get_device_list(&mut count);
            if list.is_null() {
                return Err(setup_err("ibv_get_device_list failed"));
            }

            let mut chosen = ptr::null_mut();
            for i in 0..count as usize {
                let dev = *list.add(i);
                if dev.is_null() {
                    continue;
                }
                match device {
                    None => {
                        chosen = dev;
                        break;
                    }
                    Some(wanted) => {
                        let name = CStr::from_ptr(ffi::ibv_get_device_name(dev));
                        if name.to_string_lossy() == wanted {
                            chosen = dev;
                            break;
                        }
                    }
                }
            }

            if chosen.is_null() {
                ffi::ibv_free_device_list(list);
                return Err(Error::Setup(match device {
                    Some(name) => format!("infiniband device `{name}` not found"),
                    None => "no infiniband devices available".to_string(),
                }));
            }

            let name = CStr::from_ptr(ffi::ibv_get_device_name(chosen))
                .to_string_lossy()
                .into_owned();
            let ctx = ffi::ibv_open_device(chosen);
            ffi::ibv_free_device_list(list);
            if ctx.is_null() {
                return Err(setup_err("ibv_open_device failed"));
            }

            let pd = ffi::ibv_alloc_pd(ctx);
            if pd.is_null() {
                ffi::ibv_close_device(ctx);
                return Err(setup_err("ibv_alloc_pd failed"));
            }

            debug!(device = %name, "opened HCA");
            Ok(Self { ctx, pd })
        }
    }

    fn query_port(&self, port: u8) -> Result<ffi::ibv_port_attr> {
        // Safety: attr is a plain output struct; zero is valid for all fields.
        unsafe {
            let mut attr: ffi::ibv_port_attr = mem::zeroed();
            let rc = ffi::ibv_query_port(
                self.ctx,
                port,
                &mut attr as *mut ffi::ibv_port_attr as *mut _,
            );
            if rc != 0 {
                return Err(Error::Setup(format!(
                    "ibv_query_port({port}) failed: {}",
                    io::Error::from_raw_os_error(rc)
                )));
            }
            Ok(attr)
        }
    }

    /// Local identifier of the given physical port.
    pub fn lid(&self, port: u8) -> Result<u16> {
        Ok(self.query_port(port)?.lid)
    }

    /// Create a completion queue able to report `capacity` completions.
    pub fn create_cq(&self, capacity: u32) -> Result<CompletionQueue> {
        // Safety: the context outlives the returned queue; the transport
        // declares its verbs resources before the Hca so they drop first.
        let cq = unsafe {
            ffi::ibv_create_cq(
                self.ctx,
                capacity as i32,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        };
        if cq.is_null() {
            return Err(setup_err("ibv_create_cq failed"));
        }
        Ok(CompletionQueue { cq })
    }

    /// Create a shared receive queue with the given depth and scatter-gather
    /// width.
    pub fn create_srq(&self, depth: u32, max_sge: u32) -> Result<SharedReceiveQueue> {
        // Safety: attr is input-only; the pd outlives the queue.
        let srq = unsafe {
            let mut attr: ffi::ibv_srq_init_attr = mem::zeroed();
            attr.attr.max_wr = depth;
            attr.attr.max_sge = max_sge;
            ffi::ibv_create_srq(self.pd, &mut attr)
        };
        if srq.is_null() {
            return Err(setup_err("ibv_create_srq failed"));
        }
        Ok(SharedReceiveQueue { srq })
    }

    /// Create a reliable connected queue pair bound to an SRQ and a pair of
    /// completion queues, and move it to `INIT`.
    pub fn create_queue_pair(
        &self,
        port: u8,
        srq: &SharedReceiveQueue,
        send_cq: &CompletionQueue,
        recv_cq: &CompletionQueue,
        max_send_wr: u32,
        max_recv_wr: u32,
    ) -> Result<QueuePair> {
        let path_mtu = self.query_port(port)?.active_mtu;

        // Safety: all referenced verbs objects outlive the queue pair by the
        // transport's drop ordering.
        let qp = unsafe {
            let mut attr: ffi::ibv_qp_init_attr = mem::zeroed();
            attr.send_cq = send_cq.cq;
            attr.recv_cq = recv_cq.cq;
            attr.srq = srq.srq;
            attr.cap.max_send_wr = max_send_wr;
            attr.cap.max_recv_wr = max_recv_wr;
            attr.cap.max_send_sge = 2;
            attr.cap.max_recv_sge = 1;
            attr.qp_type = ffi::ibv_qp_type::IBV_QPT_RC;
            attr.sq_sig_all = 1;
            ffi::ibv_create_qp(self.pd, &mut attr)
        };
        if qp.is_null() {
            return Err(setup_err("ibv_create_qp failed"));
        }

        let initial_psn = rand::random::<u32>() & 0x00ff_ffff;
        let pair = QueuePair {
            qp,
            port,
            path_mtu,
            initial_psn,
        };
        pair.to_init()?;
        Ok(pair)
    }

    /// Register `len` bytes starting at `addr` with the protection domain
    /// for local access.
    ///
    /// # Safety
    /// The region must stay mapped and unmoved for the registration's
    /// lifetime.
    pub unsafe fn register_region(&self, addr: *mut u8, len: usize) -> Result<MemoryRegion> {
        let access = ffi::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
        let mr = ffi::ibv_reg_mr(self.pd, addr as *mut _, len, access.0 as i32);
        if mr.is_null() {
            return Err(setup_err("ibv_reg_mr failed"));
        }
        Ok(MemoryRegion { mr })
    }
}

impl Drop for Hca {
    fn drop(&mut self) {
        // Safety: all dependent verbs objects were destroyed by their own
        // drops before the Hca (field ordering in the transport).
        unsafe {
            ffi::ibv_dealloc_pd(self.pd);
            ffi::ibv_close_device(self.ctx);
        }
    }
}

/// A registered memory region. Deregisters on drop.
pub struct MemoryRegion {
    mr: *mut ffi::ibv_mr,
}

impl MemoryRegion {
    /// Local key used in scatter-gather entries.
    pub fn lkey(&self) -> u32 {
        // Safety: mr stays valid until drop.
        unsafe { (*self.mr).lkey }
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        // Safety: registration is released exactly once.
        unsafe {
            ffi::ibv_dereg_mr(self.mr);
        }
    }
}

/// A completion queue.
pub struct CompletionQueue {
    cq: *mut ffi::ibv_cq,
}

impl CompletionQueue {
    /// Drain up to `completions.len()` work completions. Returns how many
    /// entries of `completions` were filled.
    pub fn poll(&self, completions: &mut [WorkCompletion]) -> Result<usize> {
        // Safety: WorkCompletion is layout-compatible with ibv_wc and the
        // driver writes at most `len` entries.
        let n = unsafe {
            let ops = &mut (*(*self.cq).context).ops;
            let poll_cq = ops.poll_cq.ok_or_else(|| {
                Error::Setup("driver does not provide poll_cq".to_string())
            })?;
            poll_cq(
                self.cq,
                completions.len() as i32,
                completions.as_mut_ptr() as *mut ffi::ibv_wc,
            )
        };
        if n < 0 {
            return Err(Error::PostFailed {
                op: "poll_cq",
                source: io::Error::last_os_error(),
            });
        }
        Ok(n as usize)
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        // Safety: every queue pair using this CQ has already been destroyed.
        unsafe {
            ffi::ibv_destroy_cq(self.cq);
        }
    }
}

/// A shared receive queue.
pub struct SharedReceiveQueue {
    srq: *mut ffi::ibv_srq,
}

impl SharedReceiveQueue {
    /// Post one single-segment receive. `wr_id` comes back in the matching
    /// completion and identifies the buffer.
    pub fn post_receive(&self, wr_id: u64, addr: u64, len: u32, lkey: u32) -> Result<()> {
        let mut sge = ffi::ibv_sge {
            addr,
            length: len,
            lkey,
        };
        // Safety: sge and wr are alive across the call; the driver copies
        // what it needs before returning.
        unsafe {
            let mut wr: ffi::ibv_recv_wr = mem::zeroed();
            wr.wr_id = wr_id;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            let mut bad_wr: *mut ffi::ibv_recv_wr = ptr::null_mut();

            let ops = &mut (*(*self.srq).context).ops;
            let post = ops.post_srq_recv.ok_or_else(|| {
                Error::Setup("driver does not provide post_srq_recv".to_string())
            })?;
            let rc = post(self.srq, &mut wr, &mut bad_wr);
            if rc != 0 {
                return Err(Error::PostFailed {
                    op: "srq receive",
                    source: io::Error::from_raw_os_error(rc),
                });
            }
        }
        Ok(())
    }
}

impl Drop for SharedReceiveQueue {
    fn drop(&mut self) {
        // Safety: destroyed after all queue pairs bound to it.
        unsafe {
            ffi::ibv_destroy_srq(self.srq);
        }
    }
}

/// One reliable connected channel.
///
/// Created in `INIT`; [`QueuePair::plumb`] advances it through `RTR` to
/// `RTS` using the peer's tuple.
pub struct QueuePair {
    qp: *mut ffi::ibv_qp,
    port: u8,
    path_mtu: u32,
    initial_psn: u32,
}

impl QueuePair {
    /// Local queue pair number.
    pub fn qpn(&self) -> u32 {
        // Safety: qp stays valid until drop.
        unsafe { (*self.qp).qp_num }
    }

    /// The packet serial number this end starts sending with.
    pub fn initial_psn(&self) -> u32 {
        self.initial_psn
    }

    fn modify(&self, attr: &mut ffi::ibv_qp_attr, mask: ffi::ibv_qp_attr_mask) -> Result<()> {
        // Safety: attr is input-only for these transitions.
        let rc = unsafe { ffi::ibv_modify_qp(self.qp, attr, mask.0 as i32) };
        if rc != 0 {
            return Err(Error::Setup(format!(
                "ibv_modify_qp failed: {}",
                io::Error::from_raw_os_error(rc)
            )));
        }
        Ok(())
    }

    fn to_init(&self) -> Result<()> {
        // Safety: zeroed attr then explicit field writes.
        let mut attr: ffi::ibv_qp_attr = unsafe { mem::zeroed() };
        attr.qp_state = ffi::ibv_qp_state::IBV_QPS_INIT;
        attr.pkey_index = 0;
        attr.port_num = self.port;
        attr.qp_access_flags = 0;
        self.modify(
            &mut attr,
            ffi::ibv_qp_attr_mask::IBV_QP_STATE
                | ffi::ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                | ffi::ibv_qp_attr_mask::IBV_QP_PORT
                | ffi::ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS,
        )
    }

    /// Connect this queue pair to the peer described by `peer`: advance
    /// `INIT -> RTR -> RTS`.
    pub fn plumb(&self, peer: &QueuePairTuple) -> Result<()> {
        // Safety: zeroed attr then explicit field writes for each state.
        let mut attr: ffi::ibv_qp_attr = unsafe { mem::zeroed() };
        attr.qp_state = ffi::ibv_qp_state::IBV_QPS_RTR;
        attr.path_mtu = self.path_mtu;
        attr.dest_qp_num = peer.qpn;
        attr.rq_psn = peer.psn;
        attr.max_dest_rd_atomic = 1;
        attr.min_rnr_timer = 12;
        attr.ah_attr.is_global = 0;
        attr.ah_attr.dlid = peer.lid;
        attr.ah_attr.sl = 0;
        attr.ah_attr.src_path_bits = 0;
        attr.ah_attr.port_num = self.port;
        self.modify(
            &mut attr,
            ffi::ibv_qp_attr_mask::IBV_QP_STATE
                | ffi::ibv_qp_attr_mask::IBV_QP_AV
                | ffi::ibv_qp_attr_mask::IBV_QP_PATH_MTU
                | ffi::ibv_qp_attr_mask::IBV_QP_DEST_QPN
                | ffi::ibv_qp_attr_mask::IBV_QP_RQ_PSN
                | ffi::ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                | ffi::ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER,
        )?;

        let mut attr: ffi::ibv_qp_attr = unsafe { mem::zeroed() };
        attr.qp_state = ffi::ibv_qp_state::IBV_QPS_RTS;
        attr.timeout = 14;
        attr.retry_cnt = 7;
        attr.rnr_retry = 7;
        attr.sq_psn = self.initial_psn;
        attr.max_rd_atomic = 1;
        self.modify(
            &mut attr,
            ffi::ibv_qp_attr_mask::IBV_QP_STATE
                | ffi::ibv_qp_attr_mask::IBV_QP_TIMEOUT
                | ffi::ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                | ffi::ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                | ffi::ibv_qp_attr_mask::IBV_QP_SQ_PSN
                | ffi::ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC,
        )?;

        debug!(qpn = self.qpn(), peer_qpn = peer.qpn, peer_lid = peer.lid, "plumbed queue pair");
        Ok(())
    }

    /// Post a signaled send of one or two scatter-gather segments.
    pub fn post_send(
        &self,
        wr_id: u64,
        first: (u64, u32, u32),
        second: Option<(u64, u32, u32)>,
    ) -> Result<()> {
        let mut sges = [
            ffi::ibv_sge {
                addr: first.0,
                length: first.1,
                lkey: first.2,
            },
            ffi::ibv_sge {
                addr: 0,
                length: 0,
                lkey: 0,
            },
        ];
        let mut num_sge = 1;
        if let Some((addr, length, lkey)) = second {
            sges[1] = ffi::ibv_sge { addr, length, lkey };
            num_sge = 2;
        }

        // Safety: sges and wr outlive the call; the driver copies the work
        // request before returning.
        unsafe {
            let mut wr: ffi::ibv_send_wr = mem::zeroed();
            wr.wr_id = wr_id;
            wr.sg_list = sges.as_mut_ptr();
            wr.num_sge = num_sge;
            wr.opcode = ffi::ibv_wr_opcode::IBV_WR_SEND;
            wr.send_flags = ffi::ibv_send_flags::IBV_SEND_SIGNALED.0;
            let mut bad_wr: *mut ffi::ibv_send_wr = ptr::null_mut();

            let ops = &mut (*(*self.qp).context).ops;
            let post = ops
                .post_send
                .ok_or_else(|| Error::Setup("driver does not provide post_send".to_string()))?;
            let rc = post(self.qp, &mut wr, &mut bad_wr);
            if rc != 0 {
                return Err(Error::PostFailed {
                    op: "send",
                    source: io::Error::from_raw_os_error(rc),
                });
            }
        }
        Ok(())
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        // Safety: destroyed exactly once; outstanding work requests flush.
        unsafe {
            ffi::ibv_destroy_qp(self.qp);
        }
    }
}
