//! Request dispatch.
//!
//! One inbound frame produces at most one operation-table invocation and
//! at most one reply:
//!
//! ```text
//!   frame ──▶ decode header ──▶ pre-hook ──▶ classify
//!                                              │
//!                    ┌─────────────────────────┼──────────────┐
//!                    ▼                         ▼              ▼
//!               structural                per-object      peer error
//!              (mount-level)          (cookie → node)    (hook, no reply)
//!                    │                         │
//!                    └──────────┬──────────────┘
//!                               ▼
//!                  post-hook ──▶ reply (if requested)
//! ```
//!
//! Handler failures become a numeric status in the reply header and
//! never escalate. A [`DispatchError`] (malformed header, dead channel)
//! fails the current request only; the serve loop logs it and keeps
//! consuming.

use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::error::{DispatchError, Errno, OpResult};
use crate::mount::Lifecycle;
use crate::registry::{CookieMap, IdentityCookieMap, Node, Registry};
use crate::transport::{Channel, Frame, DEFAULT_MAX_FRAME_SIZE};
use crate::wire::{self, NodeOp, OpClass, StructuralOp, WireHeader, HEADER_LEN};

use super::hooks::DispatchHooks;
use super::ops::{FilesystemOps, NewNode};

/// Maps inbound requests onto an operation table.
pub struct Dispatcher<F: FilesystemOps> {
    ops: Arc<F>,
    registry: Arc<Registry<F::Data>>,
    cookie_map: Arc<dyn CookieMap<F::Data>>,
    hooks: DispatchHooks,
    max_frame_size: usize,
}

impl<F: FilesystemOps> Dispatcher<F> {
    /// Creates a dispatcher with the identity cookie mapping and no hooks.
    pub fn new(ops: Arc<F>, registry: Arc<Registry<F::Data>>) -> Self {
        Self {
            ops,
            registry,
            cookie_map: Arc::new(IdentityCookieMap),
            hooks: DispatchHooks::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Replaces the cookie-to-node mapping.
    pub fn with_cookie_map(mut self, map: Arc<dyn CookieMap<F::Data>>) -> Self {
        self.cookie_map = map;
        self
    }

    /// Installs observation hooks.
    pub fn with_hooks(mut self, hooks: DispatchHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Sets the size limit for reply frames.
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Dispatches one inbound request frame.
    ///
    /// Sends the reply (when one is wanted) on `channel`. The returned
    /// error covers engine-level failures only; handler errnos are
    /// reported to the peer in the reply status.
    pub async fn dispatch(
        &self,
        lifecycle: &Lifecycle,
        channel: &Channel,
        mut frame: Frame,
    ) -> Result<(), DispatchError> {
        let hdr = WireHeader::decode(&frame)?;
        trace!(
            class = ?hdr.class,
            opcode = hdr.opcode,
            request = hdr.request_id,
            "dispatching request"
        );
        if let Some(hook) = &self.hooks.pre_op {
            hook(&hdr);
        }
        frame.seek(HEADER_LEN);

        let mut body = Frame::with_limit(self.max_frame_size);
        let status = match hdr.class {
            OpClass::PeerError => {
                let payload = frame.bytes()[HEADER_LEN..].to_vec();
                warn!(status = hdr.status, "peer reported an error out of band");
                if let Some(hook) = &self.hooks.peer_error {
                    hook(hdr.status, &payload);
                }
                return Ok(());
            }
            OpClass::Structural => {
                self.run_structural(lifecycle, &hdr, &mut frame, &mut body)
                    .await
            }
            OpClass::Node => self.run_node(&hdr, &mut frame, &mut body).await,
        };
        // A header that decoded but whose argument block ran short is a
        // peer-side encoding bug; the request still gets its reply.
        let status = match status {
            Ok(status) => status,
            Err(DispatchError::Frame(e)) => {
                debug!(
                    class = ?hdr.class,
                    opcode = hdr.opcode,
                    request = hdr.request_id,
                    error = %e,
                    "malformed argument block"
                );
                Errno::INVAL.raw()
            }
            Err(e) => return Err(e),
        };

        if let Some(hook) = &self.hooks.post_op {
            hook(&hdr, status);
        }
        if hdr.reply_wanted() {
            let mut reply = Frame::with_limit(self.max_frame_size);
            wire::begin_reply(&mut reply, &hdr, status)?;
            // Error replies carry the status alone.
            if status == 0 {
                reply.put(body.bytes())?;
            }
            wire::finalize(&mut reply)?;
            channel.enqueue_fire_and_forget(reply, false)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Structural operations
    // -------------------------------------------------------------------------

    async fn run_structural(
        &self,
        lifecycle: &Lifecycle,
        hdr: &WireHeader,
        frame: &mut Frame,
        body: &mut Frame,
    ) -> Result<i32, DispatchError> {
        let Ok(op) = StructuralOp::try_from(hdr.opcode) else {
            debug!(opcode = hdr.opcode, "unknown structural opcode");
            return Ok(Errno::NOSYS.raw());
        };

        let status = match op {
            StructuralOp::Unmount => {
                if !lifecycle.begin_unmount() {
                    Errno::BUSY.raw()
                } else {
                    match self.ops.unmount().await {
                        Ok(()) => {
                            lifecycle.finish_unmount();
                            0
                        }
                        Err(e) => {
                            lifecycle.abort_unmount();
                            e.raw()
                        }
                    }
                }
            }
            StructuralOp::Statfs => match self.ops.statfs().await {
                Ok(st) => {
                    body.put_u64(st.blocks)?;
                    body.put_u64(st.blocks_free)?;
                    body.put_u64(st.files)?;
                    body.put_u64(st.files_free)?;
                    body.put_u32(st.block_size)?;
                    0
                }
                Err(e) => e.raw(),
            },
            StructuralOp::Sync => status_of(self.ops.sync().await),
            StructuralOp::HandleToNode => {
                let handle = frame.get_bytes()?;
                match self.ops.handle_to_node(&handle).await {
                    Ok(cookie) => {
                        body.put_u64(cookie)?;
                        0
                    }
                    Err(e) => e.raw(),
                }
            }
            StructuralOp::NodeToHandle => {
                let cookie = frame.get_u64()?;
                match self.cookie_map.resolve(&self.registry, cookie) {
                    None => Errno::NOENT.raw(),
                    Some(node) => match self.ops.node_to_handle(&node).await {
                        Ok(handle) => {
                            body.put_bytes(&handle)?;
                            0
                        }
                        Err(e) => e.raw(),
                    },
                }
            }
            StructuralOp::ExtattrCtl => {
                let enable = frame.get_u8()? != 0;
                status_of(self.ops.extattr_ctl(enable).await)
            }
        };
        Ok(status)
    }

    // -------------------------------------------------------------------------
    // Per-object operations
    // -------------------------------------------------------------------------

    async fn run_node(
        &self,
        hdr: &WireHeader,
        frame: &mut Frame,
        body: &mut Frame,
    ) -> Result<i32, DispatchError> {
        let Ok(op) = NodeOp::try_from(hdr.opcode) else {
            debug!(opcode = hdr.opcode, "unknown node opcode");
            return Ok(Errno::NOSYS.raw());
        };
        let cookie = frame.get_u64()?;
        let Some(node) = self.cookie_map.resolve(&self.registry, cookie) else {
            debug!(cookie, op = ?op, "request for unknown cookie");
            return Ok(Errno::NOENT.raw());
        };

        let status = match op {
            NodeOp::Lookup => {
                let name = frame.get_bytes()?;
                let result = self.ops.lookup(&node, &name).await;
                self.adopt_reply(&node, &name, result, body)?
            }
            NodeOp::Create => {
                let mode = frame.get_u32()?;
                let name = frame.get_bytes()?;
                let result = self.ops.create(&node, &name, mode).await;
                self.adopt_reply(&node, &name, result, body)?
            }
            NodeOp::Mknod => {
                let mode = frame.get_u32()?;
                let rdev = frame.get_u32()?;
                let name = frame.get_bytes()?;
                let result = self.ops.mknod(&node, &name, mode, rdev).await;
                self.adopt_reply(&node, &name, result, body)?
            }
            NodeOp::Open => {
                let flags = frame.get_u32()?;
                status_of(self.ops.open(&node, flags).await)
            }
            NodeOp::Close => {
                let flags = frame.get_u32()?;
                status_of(self.ops.close(&node, flags).await)
            }
            NodeOp::Getattr => match self.ops.getattr(&node).await {
                Ok(attr) => {
                    node.set_attr(attr);
                    wire::put_attr(body, &attr)?;
                    0
                }
                Err(e) => e.raw(),
            },
            NodeOp::Setattr => {
                let set = wire::get_setattr(frame)?;
                match self.ops.setattr(&node, &set).await {
                    Ok(attr) => {
                        node.set_attr(attr);
                        wire::put_attr(body, &attr)?;
                        0
                    }
                    Err(e) => e.raw(),
                }
            }
            NodeOp::Access => {
                let mask = frame.get_u32()?;
                status_of(self.ops.access(&node, mask).await)
            }
            NodeOp::Read => {
                let offset = frame.get_u64()?;
                let len = frame.get_u32()?;
                match self.ops.read(&node, offset, len).await {
                    Ok(data) => {
                        body.put_bytes(&data)?;
                        0
                    }
                    Err(e) => e.raw(),
                }
            }
            NodeOp::Write => {
                let offset = frame.get_u64()?;
                let data = frame.get_bytes()?;
                match self.ops.write(&node, offset, &data).await {
                    Ok(written) => {
                        body.put_u32(written)?;
                        0
                    }
                    Err(e) => e.raw(),
                }
            }
            NodeOp::Fsync => {
                let datasync = frame.get_u8()? != 0;
                status_of(self.ops.fsync(&node, datasync).await)
            }
            NodeOp::Link => {
                let target_cookie = frame.get_u64()?;
                let name = frame.get_bytes()?;
                match self.cookie_map.resolve(&self.registry, target_cookie) {
                    None => Errno::NOENT.raw(),
                    Some(target) => status_of(self.ops.link(&node, &target, &name).await),
                }
            }
            NodeOp::Unlink => {
                let name = frame.get_bytes()?;
                status_of(self.ops.unlink(&node, &name).await)
            }
            NodeOp::Rename => {
                let to_cookie = frame.get_u64()?;
                let from_name = frame.get_bytes()?;
                let to_name = frame.get_bytes()?;
                match self.cookie_map.resolve(&self.registry, to_cookie) {
                    None => Errno::NOENT.raw(),
                    Some(to_parent) => {
                        match self
                            .ops
                            .rename(&node, &from_name, &to_parent, &to_name)
                            .await
                        {
                            Ok(()) => {
                                self.rename_paths(&node, &from_name, &to_parent, &to_name);
                                0
                            }
                            Err(e) => e.raw(),
                        }
                    }
                }
            }
            NodeOp::Mkdir => {
                let mode = frame.get_u32()?;
                let name = frame.get_bytes()?;
                let result = self.ops.mkdir(&node, &name, mode).await;
                self.adopt_reply(&node, &name, result, body)?
            }
            NodeOp::Rmdir => {
                let name = frame.get_bytes()?;
                status_of(self.ops.rmdir(&node, &name).await)
            }
            NodeOp::Symlink => {
                let name = frame.get_bytes()?;
                let target = frame.get_bytes()?;
                let result = self.ops.symlink(&node, &name, &target).await;
                self.adopt_reply(&node, &name, result, body)?
            }
            NodeOp::Readlink => match self.ops.readlink(&node).await {
                Ok(target) => {
                    body.put_bytes(&target)?;
                    0
                }
                Err(e) => e.raw(),
            },
            NodeOp::Readdir => {
                let offset = frame.get_u64()?;
                match self.ops.readdir(&node, offset).await {
                    Ok(entries) => {
                        body.put_u32(entries.len() as u32)?;
                        for entry in &entries {
                            wire::put_dirent(body, entry.cookie, entry.kind, &entry.name)?;
                        }
                        0
                    }
                    Err(e) => e.raw(),
                }
            }
            NodeOp::GetXattr => {
                let name = frame.get_bytes()?;
                match self.ops.getxattr(&node, &name).await {
                    Ok(value) => {
                        body.put_bytes(&value)?;
                        0
                    }
                    Err(e) => e.raw(),
                }
            }
            NodeOp::SetXattr => {
                let name = frame.get_bytes()?;
                let value = frame.get_bytes()?;
                status_of(self.ops.setxattr(&node, &name, &value).await)
            }
            NodeOp::ListXattr => match self.ops.listxattr(&node).await {
                Ok(names) => {
                    body.put_u32(names.len() as u32)?;
                    for name in &names {
                        body.put_bytes(name)?;
                    }
                    0
                }
                Err(e) => e.raw(),
            },
            NodeOp::RemoveXattr => {
                let name = frame.get_bytes()?;
                status_of(self.ops.removexattr(&node, &name).await)
            }
            NodeOp::Fallocate => {
                let offset = frame.get_u64()?;
                let len = frame.get_u64()?;
                status_of(self.ops.fallocate(&node, offset, len).await)
            }
            NodeOp::Fdiscard => {
                let offset = frame.get_u64()?;
                let len = frame.get_u64()?;
                status_of(self.ops.fdiscard(&node, offset, len).await)
            }
            NodeOp::Reclaim => {
                let status = status_of(self.ops.reclaim(&node).await);
                // The peer has forgotten the cookie; drop the registry
                // entry regardless of the handler's answer.
                if let Err(e) = self.registry.release(&node) {
                    debug!(error = %e, "reclaim of unregistered node");
                }
                self.registry.unref(&node);
                status
            }
        };
        Ok(status)
    }

    /// Registers a freshly produced object and encodes the standard
    /// cookie-plus-attributes reply body.
    ///
    /// The path (in path mode) is built before the node is registered,
    /// so a path failure leaves no partially adopted object behind. The
    /// reference count is bumped exactly once per adoption.
    fn adopt_reply(
        &self,
        parent: &Arc<Node<F::Data>>,
        name: &[u8],
        result: OpResult<NewNode<F::Data>>,
        body: &mut Frame,
    ) -> Result<i32, DispatchError> {
        let NewNode { cookie, data, attr } = match result {
            Ok(new) => new,
            Err(e) => return Ok(e.raw()),
        };

        let path = if self.registry.path_mode().enabled() {
            match self.registry.path_build(parent, name) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(error = %e, cookie, "path build failed, object not adopted");
                    return Ok(Errno::NOMEM.raw());
                }
            }
        } else {
            None
        };

        let child = self.registry.register(cookie, data, attr);
        child.set_attr(attr);
        if let Some(p) = path {
            child.set_cached_path(p);
        }
        child.ref_inc();

        body.put_u64(child.cookie())?;
        wire::put_attr(body, &attr)?;
        Ok(0)
    }

    /// Rewrites cached paths after a successful rename: the renamed
    /// node gets its new path and every strict descendant is rebased.
    fn rename_paths(
        &self,
        from_parent: &Arc<Node<F::Data>>,
        from_name: &[u8],
        to_parent: &Arc<Node<F::Data>>,
        to_name: &[u8],
    ) {
        if !self.registry.path_mode().enabled() {
            return;
        }
        let (old, new) = match (
            self.registry.path_build(from_parent, from_name),
            self.registry.path_build(to_parent, to_name),
        ) {
            (Ok(old), Ok(new)) => (old, new),
            _ => {
                warn!("path rebuild after rename failed, cached paths may be stale");
                return;
            }
        };
        if let Some(moved) = self.registry.find_by_path(old.as_bytes()) {
            moved.set_cached_path(new.clone());
        }
        let rewritten = self
            .registry
            .path_prefix_rewrite(old.as_bytes(), new.as_bytes());
        trace!(rewritten, "rename path rewrite");
    }
}

fn status_of(result: OpResult<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.raw(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CachedPath, NodeAttr, NodeKind, PathMode};
    use crate::transport::Transport;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::sync::mpsc;

    fn dir_attr() -> NodeAttr {
        NodeAttr {
            kind: NodeKind::Dir,
            nlink: 2,
            ..NodeAttr::default()
        }
    }

    fn file_attr() -> NodeAttr {
        NodeAttr {
            kind: NodeKind::File,
            nlink: 1,
            size: 5,
            ..NodeAttr::default()
        }
    }

    struct TestFs {
        unmount_fails: AtomicBool,
    }

    impl TestFs {
        fn new() -> Self {
            Self {
                unmount_fails: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl FilesystemOps for TestFs {
        type Data = &'static str;

        async fn init(&self) -> OpResult<NewNode<&'static str>> {
            Ok(NewNode {
                cookie: 1,
                data: "root",
                attr: dir_attr(),
            })
        }

        async fn unmount(&self) -> OpResult<()> {
            if self.unmount_fails.swap(false, Ordering::SeqCst) {
                Err(Errno::BUSY)
            } else {
                Ok(())
            }
        }

        async fn lookup(
            &self,
            _parent: &Node<&'static str>,
            name: &[u8],
        ) -> OpResult<NewNode<&'static str>> {
            match name {
                b"file" => Ok(NewNode {
                    cookie: 2,
                    data: "file",
                    attr: file_attr(),
                }),
                b"dir" => Ok(NewNode {
                    cookie: 3,
                    data: "dir",
                    attr: dir_attr(),
                }),
                _ => Err(Errno::NOENT),
            }
        }

        async fn getattr(&self, node: &Node<&'static str>) -> OpResult<NodeAttr> {
            Ok(node.attr())
        }

        async fn read(
            &self,
            _node: &Node<&'static str>,
            offset: u64,
            len: u32,
        ) -> OpResult<Vec<u8>> {
            let data = b"hello";
            let start = (offset as usize).min(data.len());
            let end = (start + len as usize).min(data.len());
            Ok(data[start..end].to_vec())
        }

        async fn rename(
            &self,
            _from_parent: &Node<&'static str>,
            _from_name: &[u8],
            _to_parent: &Node<&'static str>,
            _to_name: &[u8],
        ) -> OpResult<()> {
            Ok(())
        }
    }

    struct Rig {
        dispatcher: Dispatcher<TestFs>,
        registry: Arc<Registry<&'static str>>,
        lifecycle: Lifecycle,
        channel: Channel,
        far: DuplexStream,
        _transport: Transport,
        _request_rx: mpsc::UnboundedReceiver<Frame>,
    }

    fn rig() -> Rig {
        rig_with(DispatchHooks::default())
    }

    fn rig_with(hooks: DispatchHooks) -> Rig {
        let ops = Arc::new(TestFs::new());
        let registry = Arc::new(Registry::new(PathMode::Cached));
        let root = registry.register(1, "root", dir_attr());
        root.set_cached_path(CachedPath::new(b"/".to_vec(), PathMode::Cached));
        root.ref_inc();

        let dispatcher = Dispatcher::new(ops, registry.clone()).with_hooks(hooks);
        let lifecycle = Lifecycle::new();
        lifecycle.set_mounted();

        let transport = Transport::new();
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let channel = transport.add_channel(near, request_tx);

        Rig {
            dispatcher,
            registry,
            lifecycle,
            channel,
            far,
            _transport: transport,
            _request_rx: request_rx,
        }
    }

    fn node_request(op: NodeOp, request_id: u64, cookie: u64, args: impl FnOnce(&mut Frame)) -> Frame {
        raw_request(OpClass::Node, op as u16, request_id, |frame| {
            frame.put_u64(cookie).unwrap();
            args(frame);
        })
    }

    fn raw_request(
        class: OpClass,
        opcode: u16,
        request_id: u64,
        args: impl FnOnce(&mut Frame),
    ) -> Frame {
        let mut frame = Frame::new();
        wire::begin_request(&mut frame, class, opcode, request_id, true).unwrap();
        args(&mut frame);
        wire::finalize(&mut frame).unwrap();
        frame
    }

    async fn read_reply(far: &mut DuplexStream) -> (WireHeader, Frame) {
        let mut len_buf = [0u8; 4];
        far.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut rest = vec![0u8; len - 4];
        far.read_exact(&mut rest).await.unwrap();

        let mut bytes = bytes::BytesMut::from(&len_buf[..]);
        bytes.extend_from_slice(&rest);
        let mut frame = Frame::from_bytes(bytes, DEFAULT_MAX_FRAME_SIZE);
        let hdr = WireHeader::decode(&frame).unwrap();
        frame.seek(HEADER_LEN);
        (hdr, frame)
    }

    #[tokio::test]
    async fn test_lookup_adopts_node_and_replies() {
        let mut rig = rig();
        let request = node_request(NodeOp::Lookup, 10, 1, |f| f.put_bytes(b"file").unwrap());
        rig.dispatcher
            .dispatch(&rig.lifecycle, &rig.channel, request)
            .await
            .unwrap();

        let (hdr, mut reply) = read_reply(&mut rig.far).await;
        assert!(hdr.is_response());
        assert_eq!(hdr.request_id, 10);
        assert_eq!(hdr.status, 0);
        assert_eq!(reply.get_u64().unwrap(), 2);
        let attr = wire::get_attr(&mut reply).unwrap();
        assert_eq!(attr.kind, NodeKind::File);
        assert_eq!(attr.size, 5);

        let child = rig.registry.find_by_cookie(2).unwrap();
        assert_eq!(child.refs(), 1);
        assert_eq!(child.cached_path().unwrap().as_bytes(), b"/file");
    }

    #[tokio::test]
    async fn test_lookup_miss_replies_status_only() {
        let mut rig = rig();
        let request = node_request(NodeOp::Lookup, 11, 1, |f| f.put_bytes(b"nope").unwrap());
        rig.dispatcher
            .dispatch(&rig.lifecycle, &rig.channel, request)
            .await
            .unwrap();

        let (hdr, reply) = read_reply(&mut rig.far).await;
        assert_eq!(hdr.status, libc::ENOENT);
        assert_eq!(reply.len(), HEADER_LEN);
        assert!(rig.registry.find_by_cookie(2).is_none());
    }

    #[tokio::test]
    async fn test_unknown_cookie_replies_enoent() {
        let mut rig = rig();
        let request = node_request(NodeOp::Getattr, 12, 99, |_| {});
        rig.dispatcher
            .dispatch(&rig.lifecycle, &rig.channel, request)
            .await
            .unwrap();

        let (hdr, _) = read_reply(&mut rig.far).await;
        assert_eq!(hdr.status, libc::ENOENT);
    }

    #[tokio::test]
    async fn test_unknown_opcode_replies_enosys() {
        let mut rig = rig();
        let request = raw_request(OpClass::Node, 77, 13, |f| f.put_u64(1).unwrap());
        rig.dispatcher
            .dispatch(&rig.lifecycle, &rig.channel, request)
            .await
            .unwrap();

        let (hdr, _) = read_reply(&mut rig.far).await;
        assert_eq!(hdr.status, libc::ENOSYS);
    }

    #[tokio::test]
    async fn test_truncated_arguments_reply_einval() {
        let mut rig = rig();
        // Getattr with the cookie missing entirely.
        let request = raw_request(OpClass::Node, NodeOp::Getattr as u16, 25, |_| {});
        rig.dispatcher
            .dispatch(&rig.lifecycle, &rig.channel, request)
            .await
            .unwrap();

        let (hdr, reply) = read_reply(&mut rig.far).await;
        assert_eq!(hdr.request_id, 25);
        assert_eq!(hdr.status, libc::EINVAL);
        assert_eq!(reply.len(), HEADER_LEN);

        // The dispatcher keeps serving well-formed requests afterwards.
        let request = node_request(NodeOp::Getattr, 26, 1, |_| {});
        rig.dispatcher
            .dispatch(&rig.lifecycle, &rig.channel, request)
            .await
            .unwrap();
        let (hdr, _) = read_reply(&mut rig.far).await;
        assert_eq!(hdr.request_id, 26);
        assert_eq!(hdr.status, 0);
    }

    #[tokio::test]
    async fn test_unset_table_slot_replies_enosys() {
        let mut rig = rig();
        // TestFs does not implement readlink.
        let request = node_request(NodeOp::Readlink, 14, 1, |_| {});
        rig.dispatcher
            .dispatch(&rig.lifecycle, &rig.channel, request)
            .await
            .unwrap();

        let (hdr, _) = read_reply(&mut rig.far).await;
        assert_eq!(hdr.status, libc::ENOSYS);
    }

    #[tokio::test]
    async fn test_read_returns_payload() {
        let mut rig = rig();
        rig.registry.register(2, "file", file_attr());
        let request = node_request(NodeOp::Read, 15, 2, |f| {
            f.put_u64(1).unwrap();
            f.put_u32(3).unwrap();
        });
        rig.dispatcher
            .dispatch(&rig.lifecycle, &rig.channel, request)
            .await
            .unwrap();

        let (hdr, mut reply) = read_reply(&mut rig.far).await;
        assert_eq!(hdr.status, 0);
        assert_eq!(reply.get_bytes().unwrap(), b"ell");
    }

    #[tokio::test]
    async fn test_rename_rewrites_cached_paths() {
        let mut rig = rig();
        let mode = rig.registry.path_mode();
        let dir = rig.registry.register(3, "dir", dir_attr());
        dir.set_cached_path(CachedPath::new(b"/a".to_vec(), mode));
        let inner = rig.registry.register(4, "inner", file_attr());
        inner.set_cached_path(CachedPath::new(b"/a/b".to_vec(), mode));

        // Rename /a to /c; both parents are the root.
        let request = node_request(NodeOp::Rename, 16, 1, |f| {
            f.put_u64(1).unwrap();
            f.put_bytes(b"a").unwrap();
            f.put_bytes(b"c").unwrap();
        });
        rig.dispatcher
            .dispatch(&rig.lifecycle, &rig.channel, request)
            .await
            .unwrap();

        let (hdr, _) = read_reply(&mut rig.far).await;
        assert_eq!(hdr.status, 0);
        assert_eq!(dir.cached_path().unwrap().as_bytes(), b"/c");
        assert_eq!(inner.cached_path().unwrap().as_bytes(), b"/c/b");
    }

    #[tokio::test]
    async fn test_reclaim_drops_registry_entry() {
        let mut rig = rig();
        let lookup = node_request(NodeOp::Lookup, 17, 1, |f| f.put_bytes(b"file").unwrap());
        rig.dispatcher
            .dispatch(&rig.lifecycle, &rig.channel, lookup)
            .await
            .unwrap();
        read_reply(&mut rig.far).await;
        assert!(rig.registry.find_by_cookie(2).is_some());

        let reclaim = node_request(NodeOp::Reclaim, 18, 2, |_| {});
        rig.dispatcher
            .dispatch(&rig.lifecycle, &rig.channel, reclaim)
            .await
            .unwrap();

        let (hdr, _) = read_reply(&mut rig.far).await;
        assert_eq!(hdr.status, 0);
        assert!(rig.registry.find_by_cookie(2).is_none());
        assert_eq!(rig.registry.removed_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_unmount_reverts_lifecycle() {
        let mut rig = rig();
        rig.dispatcher.ops.unmount_fails.store(true, Ordering::SeqCst);

        let request = raw_request(OpClass::Structural, StructuralOp::Unmount as u16, 19, |_| {});
        rig.dispatcher
            .dispatch(&rig.lifecycle, &rig.channel, request)
            .await
            .unwrap();
        let (hdr, _) = read_reply(&mut rig.far).await;
        assert_eq!(hdr.status, libc::EBUSY);
        assert_eq!(rig.lifecycle.state(), crate::mount::MountState::Mounted);

        let retry = raw_request(OpClass::Structural, StructuralOp::Unmount as u16, 20, |_| {});
        rig.dispatcher
            .dispatch(&rig.lifecycle, &rig.channel, retry)
            .await
            .unwrap();
        let (hdr, _) = read_reply(&mut rig.far).await;
        assert_eq!(hdr.status, 0);
        assert!(rig.lifecycle.is_dead());
    }

    #[tokio::test]
    async fn test_peer_error_invokes_hook_and_sends_no_reply() {
        let reported = Arc::new(Mutex::new(None));
        let reported2 = reported.clone();
        let hooks = DispatchHooks::new()
            .on_peer_error(move |status, payload| {
                *reported2.lock() = Some((status, payload.to_vec()));
            });
        let mut rig = rig_with(hooks);

        let mut report = Frame::new();
        wire::begin_request(&mut report, OpClass::PeerError, 0, 21, true).unwrap();
        report.put_i32_at(12, libc::EIO).unwrap();
        report.put(b"backend gone").unwrap();
        wire::finalize(&mut report).unwrap();
        rig.dispatcher
            .dispatch(&rig.lifecycle, &rig.channel, report)
            .await
            .unwrap();

        assert_eq!(
            *reported.lock(),
            Some((libc::EIO, b"backend gone".to_vec()))
        );

        // The next reply on the wire belongs to a later request, proving
        // the report itself produced none.
        let follow_up = node_request(NodeOp::Getattr, 22, 1, |_| {});
        rig.dispatcher
            .dispatch(&rig.lifecycle, &rig.channel, follow_up)
            .await
            .unwrap();
        let (hdr, _) = read_reply(&mut rig.far).await;
        assert_eq!(hdr.request_id, 22);
    }

    #[tokio::test]
    async fn test_hooks_observe_request_and_status() {
        let pre = Arc::new(AtomicUsize::new(0));
        let post_status = Arc::new(Mutex::new(None));
        let pre2 = pre.clone();
        let post2 = post_status.clone();
        let hooks = DispatchHooks::new()
            .on_pre_op(move |_| {
                pre2.fetch_add(1, Ordering::SeqCst);
            })
            .on_post_op(move |_, status| {
                *post2.lock() = Some(status);
            });
        let mut rig = rig_with(hooks);

        let request = node_request(NodeOp::Lookup, 23, 1, |f| f.put_bytes(b"nope").unwrap());
        rig.dispatcher
            .dispatch(&rig.lifecycle, &rig.channel, request)
            .await
            .unwrap();
        read_reply(&mut rig.far).await;

        assert_eq!(pre.load(Ordering::SeqCst), 1);
        assert_eq!(*post_status.lock(), Some(libc::ENOENT));
    }

    #[tokio::test]
    async fn test_malformed_header_is_an_engine_error() {
        let rig = rig();
        let mut frame = node_request(NodeOp::Getattr, 24, 1, |_| {});
        frame.put_u32_at(0, 9999).unwrap();

        let err = rig
            .dispatcher
            .dispatch(&rig.lifecycle, &rig.channel, frame)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Malformed(_)));
    }
}
