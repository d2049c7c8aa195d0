// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Session parameters objects.
//!
//! Parameter sets reach the decoder before, between and after sessions exist, so they are first
//! queued on a [`SessionParameters`] object and only pushed to the device when the object is
//! flushed against a session. The first set flushed creates the device object, optionally from
//! a template object whose sets it inherits; later ones are added as updates.
//!
//! A device object cannot receive a set whose key it already holds, so a set reusing an ID
//! starts a new object using the current one as template.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use log::debug;
use log::trace;
use thiserror::Error;

use crate::codec::ParameterSetKey;
use crate::codec::ParameterSetKind;
use crate::codec::StdParameterSet;
use crate::decoder::session::VideoSession;
use crate::device::DeviceError;
use crate::device::ParametersCreateInfo;
use crate::device::ParametersHandle;
use crate::device::VideoDevice;

pub const MAX_VPS_IDS: usize = 16;
pub const MAX_SPS_IDS: usize = 32;
pub const MAX_PPS_IDS: usize = 256;
pub const MAX_AV1_SEQUENCE_HEADER_IDS: usize = 1;

const NUM_KINDS: usize = ParameterSetKind::Av1SequenceHeader as usize + 1;

static NEXT_PARAMETERS_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Error, Debug)]
pub enum ParametersError {
    #[error("{kind:?} ID {id} is out of range")]
    IdOutOfRange { kind: ParameterSetKind, id: u32 },
    #[error("{kind:?} ID {id} is already present")]
    DuplicateId { kind: ParameterSetKind, id: u32 },
    #[error("{0:?} cannot be added to an existing parameters object")]
    UpdateNotAllowed(ParameterSetKind),
    #[error("parameters object is bound to another session")]
    WrongSession,
    #[error("no session to flush parameters against")]
    NoSession,
    #[error(transparent)]
    Device(#[from] DeviceError),
}

pub type ParametersResult<T> = std::result::Result<T, ParametersError>;

/// A set of IDs below `N`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IdSet<const N: usize> {
    bits: [u64; 4],
}

impl<const N: usize> IdSet<N> {
    pub const CAPACITY: usize = N;

    /// Adds `id`, returning whether it was absent. Panics if `id` is out of range.
    pub fn insert(&mut self, id: u32) -> bool {
        assert!((id as usize) < N);
        let (word, bit) = (id as usize / 64, id % 64);
        let absent = self.bits[word] & (1 << bit) == 0;
        self.bits[word] |= 1 << bit;

        absent
    }

    pub fn contains(&self, id: u32) -> bool {
        (id as usize) < N && self.bits[id as usize / 64] & (1 << (id % 64)) != 0
    }

    pub fn len(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct IdSets {
    vps: IdSet<MAX_VPS_IDS>,
    sps: IdSet<MAX_SPS_IDS>,
    pps: IdSet<MAX_PPS_IDS>,
    av1: IdSet<MAX_AV1_SEQUENCE_HEADER_IDS>,
}

impl IdSets {
    fn capacity(kind: ParameterSetKind) -> usize {
        match kind {
            ParameterSetKind::H265Vps => MAX_VPS_IDS,
            ParameterSetKind::H264Sps | ParameterSetKind::H265Sps => MAX_SPS_IDS,
            ParameterSetKind::H264Pps | ParameterSetKind::H265Pps => MAX_PPS_IDS,
            ParameterSetKind::Av1SequenceHeader => MAX_AV1_SEQUENCE_HEADER_IDS,
        }
    }

    fn insert(&mut self, kind: ParameterSetKind, id: u32) -> ParametersResult<bool> {
        if id as usize >= Self::capacity(kind) {
            return Err(ParametersError::IdOutOfRange { kind, id });
        }

        Ok(match kind {
            ParameterSetKind::H265Vps => self.vps.insert(id),
            ParameterSetKind::H264Sps | ParameterSetKind::H265Sps => self.sps.insert(id),
            ParameterSetKind::H264Pps | ParameterSetKind::H265Pps => self.pps.insert(id),
            ParameterSetKind::Av1SequenceHeader => self.av1.insert(id),
        })
    }

    fn contains(&self, kind: ParameterSetKind, id: u32) -> bool {
        match kind {
            ParameterSetKind::H265Vps => self.vps.contains(id),
            ParameterSetKind::H264Sps | ParameterSetKind::H265Sps => self.sps.contains(id),
            ParameterSetKind::H264Pps | ParameterSetKind::H265Pps => self.pps.contains(id),
            ParameterSetKind::Av1SequenceHeader => self.av1.contains(id),
        }
    }
}

/// The kind one level up in the VPS/SPS/PPS hierarchy, and the ID of the set of that kind
/// `set` refers to.
fn parent_of(set: &StdParameterSet) -> Option<(ParameterSetKind, Option<u8>)> {
    match set.kind() {
        ParameterSetKind::H264Pps => Some((ParameterSetKind::H264Sps, set.sps_id())),
        ParameterSetKind::H265Pps => Some((ParameterSetKind::H265Sps, set.sps_id())),
        ParameterSetKind::H265Sps => Some((ParameterSetKind::H265Vps, set.vps_id())),
        _ => None,
    }
}

fn child_kind(kind: ParameterSetKind) -> Option<ParameterSetKind> {
    match kind {
        ParameterSetKind::H264Sps => Some(ParameterSetKind::H264Pps),
        ParameterSetKind::H265Sps => Some(ParameterSetKind::H265Pps),
        ParameterSetKind::H265Vps => Some(ParameterSetKind::H265Sps),
        _ => None,
    }
}

/// A session parameters object and the sets waiting to be added to it.
pub struct SessionParameters {
    device: Rc<dyn VideoDevice>,
    /// Assigned when the device object is created.
    id: Option<u32>,
    handle: Option<ParametersHandle>,
    session: Option<Rc<VideoSession>>,
    /// Object whose sets are inherited, until the device object is created.
    template: Option<Rc<RefCell<SessionParameters>>>,
    queue: VecDeque<Rc<StdParameterSet>>,
    /// The last set of each kind added.
    last_by_kind: [Option<Rc<StdParameterSet>>; NUM_KINDS],
    ids: IdSets,
    /// Every set this object holds or will hold once flushed, inherited ones included.
    known_sets: BTreeMap<ParameterSetKey, Rc<StdParameterSet>>,
    update_count: u32,
}

impl fmt::Debug for SessionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionParameters")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("queue", &self.queue.len())
            .field("known_sets", &self.known_sets.keys().collect::<Vec<_>>())
            .field("update_count", &self.update_count)
            .finish()
    }
}

impl SessionParameters {
    /// Creates an object inheriting the IDs and sets of `template`.
    pub fn create(
        device: &Rc<dyn VideoDevice>,
        template: Option<Rc<RefCell<SessionParameters>>>,
    ) -> Rc<RefCell<Self>> {
        let (ids, known_sets, last_by_kind) = match &template {
            Some(template) => {
                let template = template.borrow();
                (
                    template.ids.clone(),
                    template.known_sets.clone(),
                    template.last_by_kind.clone(),
                )
            }
            None => Default::default(),
        };

        Rc::new(RefCell::new(Self {
            device: Rc::clone(device),
            id: None,
            handle: None,
            session: None,
            template,
            queue: VecDeque::new(),
            last_by_kind,
            ids,
            known_sets,
            update_count: 0,
        }))
    }

    /// Queues `set` on `current`, replacing `current` with a new object first if the set cannot
    /// be added to it. The queue is flushed right away if `session` is given.
    ///
    /// Returns the number of sets still waiting for a session.
    pub fn add_picture_parameters(
        device: &Rc<dyn VideoDevice>,
        session: Option<&Rc<VideoSession>>,
        set: &Rc<StdParameterSet>,
        current: &mut Option<Rc<RefCell<SessionParameters>>>,
    ) -> ParametersResult<usize> {
        if Self::check_std_object_before_update(set, current.as_ref(), session) {
            let new_object = Self::create(device, current.take());
            debug!("new session parameters object for {:?}", set.key());
            *current = Some(new_object);
        }

        let Some(current) = current else {
            return Err(ParametersError::NoSession);
        };
        let mut current = current.borrow_mut();
        current.add_picture_parameters_to_queue(set)?;
        if let Some(session) = session {
            current.flush_picture_parameters_queue(session)?;
        }

        Ok(current.queue.len())
    }

    /// Whether `set` needs a new object rather than being added to `current`.
    ///
    /// That is the case without a current object, for sets replacing an earlier set, for AV1
    /// sequence headers, for IDs `current` already holds and when `current` belongs to another
    /// session.
    pub fn check_std_object_before_update(
        set: &StdParameterSet,
        current: Option<&Rc<RefCell<SessionParameters>>>,
        session: Option<&Rc<VideoSession>>,
    ) -> bool {
        let Some(current) = current else {
            return true;
        };
        let current = current.borrow();

        set.update_sequence_count() > 0
            || set.kind() == ParameterSetKind::Av1SequenceHeader
            || current.has_id(set.kind(), set.node_id())
            || session
                .map(|session| !current.bound_session_matches(session))
                .unwrap_or(false)
    }

    /// Marks the ID of `set` as present and links it to its parent and child sets. Returns
    /// whether the ID was new to this object.
    pub fn update_picture_parameters_hierarchy(
        &mut self,
        set: &Rc<StdParameterSet>,
    ) -> ParametersResult<bool> {
        let kind = set.kind();
        let is_new = self.ids.insert(kind, set.node_id())?;

        if let Some((parent_kind, parent_id)) = parent_of(set) {
            if let Some(parent) = &self.last_by_kind[parent_kind as usize] {
                if parent_id.map(u32::from) == Some(parent.node_id()) {
                    set.set_parent(Some(Rc::clone(parent)));
                }
            }
        }
        if let Some(child_kind) = child_kind(kind) {
            if let Some(child) = &self.last_by_kind[child_kind as usize] {
                let refers_to_set = parent_of(child)
                    .and_then(|(_, id)| id)
                    .map(u32::from)
                    == Some(set.node_id());
                if refers_to_set {
                    child.set_parent(Some(Rc::clone(set)));
                }
            }
        }
        self.last_by_kind[kind as usize] = Some(Rc::clone(set));

        Ok(is_new)
    }

    /// Queues `set` to be added to the device object on the next flush. Returns the queue
    /// length.
    pub fn add_picture_parameters_to_queue(
        &mut self,
        set: &Rc<StdParameterSet>,
    ) -> ParametersResult<usize> {
        let key = set.key();
        let kind = set.kind();
        let id = set.node_id();

        if self.queue.iter().any(|queued| queued.key() == key)
            || (self.handle.is_some() && self.known_sets.contains_key(&key))
        {
            return Err(ParametersError::DuplicateId { kind, id });
        }
        if kind == ParameterSetKind::Av1SequenceHeader
            && (self.handle.is_some() || !self.queue.is_empty())
        {
            return Err(ParametersError::UpdateNotAllowed(kind));
        }

        self.update_picture_parameters_hierarchy(set)?;
        self.known_sets.insert(key, Rc::clone(set));
        self.queue.push_back(Rc::clone(set));
        trace!("queued {:?}, {} pending", key, self.queue.len());

        Ok(self.queue.len())
    }

    /// Pushes the queued sets to the device in arrival order, creating the device object
    /// against `session` if needed. Returns the number of sets flushed.
    pub fn flush_picture_parameters_queue(
        &mut self,
        session: &Rc<VideoSession>,
    ) -> ParametersResult<usize> {
        if !self.bound_session_matches(session) {
            return Err(ParametersError::WrongSession);
        }

        let mut flushed = 0;
        while let Some(set) = self.queue.front().cloned() {
            match self.handle {
                None => self.create_parameters_object(session, &set)?,
                Some(handle) => {
                    self.device.update_session_parameters(
                        handle,
                        self.update_count + 1,
                        std::slice::from_ref(&set),
                    )?;
                    self.update_count += 1;
                    trace!(
                        "updated session parameters {:?} with {:?}",
                        self.id,
                        set.key()
                    );
                }
            }
            self.queue.pop_front();
            flushed += 1;
        }

        Ok(flushed)
    }

    fn create_parameters_object(
        &mut self,
        session: &Rc<VideoSession>,
        first: &Rc<StdParameterSet>,
    ) -> ParametersResult<()> {
        let template_handle = match &self.template {
            Some(template) if template.borrow().bound_session_matches(session) => {
                let mut template = template.borrow_mut();
                template.flush_picture_parameters_queue(session)?;
                template.handle
            }
            _ => None,
        };

        // Without a usable template the inherited sets are created along with the first one.
        let mut sets = Vec::new();
        if template_handle.is_none() {
            let first_key = first.key();
            sets.extend(
                self.known_sets
                    .iter()
                    .filter(|(key, _)| {
                        **key != first_key && !self.queue.iter().any(|q| q.key() == **key)
                    })
                    .map(|(_, set)| Rc::clone(set)),
            );
        }
        sets.push(Rc::clone(first));

        let handle = self.device.create_session_parameters(&ParametersCreateInfo {
            session: session.handle(),
            template: template_handle,
            sets,
        })?;
        let id = NEXT_PARAMETERS_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            "created session parameters {} ({:?}) for session {:?}",
            id,
            handle,
            session.handle()
        );

        self.handle = Some(handle);
        self.id = Some(id);
        self.session = Some(Rc::clone(session));
        self.template = None;
        self.update_count = 0;

        Ok(())
    }

    /// Returns a new unbound object with every set of `this` queued, and makes it the client
    /// object of those sets. The caller must keep the returned object alive.
    pub fn fork(this: &Rc<RefCell<Self>>) -> Rc<RefCell<Self>> {
        let forked = {
            let this = this.borrow();
            Rc::new(RefCell::new(Self {
                device: Rc::clone(&this.device),
                id: None,
                handle: None,
                session: None,
                template: None,
                queue: this.known_sets.values().cloned().collect(),
                last_by_kind: this.last_by_kind.clone(),
                ids: this.ids.clone(),
                known_sets: this.known_sets.clone(),
                update_count: 0,
            }))
        };
        for set in forked.borrow().known_sets.values() {
            set.set_client_object(Some(Rc::clone(&forked)));
        }

        forked
    }

    /// Returns a new object holding every set of `this`, flushed against `session`. See
    /// [`SessionParameters::fork`].
    pub fn migrate(
        this: &Rc<RefCell<Self>>,
        session: &Rc<VideoSession>,
    ) -> ParametersResult<Rc<RefCell<Self>>> {
        let migrated = Self::fork(this);
        debug!(
            "moving {} parameter sets to session {:?}",
            migrated.borrow().queue.len(),
            session.handle()
        );
        migrated
            .borrow_mut()
            .flush_picture_parameters_queue(session)?;

        Ok(migrated)
    }

    /// Whether this object can be used with `session`: it is bound to it, or unbound with a
    /// template chain that is.
    pub fn bound_session_matches(&self, session: &Rc<VideoSession>) -> bool {
        match (&self.session, &self.template) {
            (Some(bound), _) => Rc::ptr_eq(bound, session),
            (None, Some(template)) => template.borrow().bound_session_matches(session),
            (None, None) => true,
        }
    }

    pub fn has_id(&self, kind: ParameterSetKind, id: u32) -> bool {
        self.ids.contains(kind, id)
    }

    pub fn has_vps_id(&self, id: u32) -> bool {
        self.ids.vps.contains(id)
    }

    pub fn has_sps_id(&self, id: u32) -> bool {
        self.ids.sps.contains(id)
    }

    pub fn has_pps_id(&self, id: u32) -> bool {
        self.ids.pps.contains(id)
    }

    pub fn has_av1_sequence_header(&self) -> bool {
        !self.ids.av1.is_empty()
    }

    pub fn id(&self) -> Option<u32> {
        self.id
    }

    pub fn handle(&self) -> Option<ParametersHandle> {
        self.handle
    }

    pub fn session(&self) -> Option<&Rc<VideoSession>> {
        self.session.as_ref()
    }

    pub fn template(&self) -> Option<&Rc<RefCell<SessionParameters>>> {
        self.template.as_ref()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn update_count(&self) -> u32 {
        self.update_count
    }

    /// Every set of this object, in VPS, SPS, PPS order.
    pub fn parameter_sets(&self) -> impl Iterator<Item = &Rc<StdParameterSet>> {
        self.known_sets.values()
    }
}

impl Drop for SessionParameters {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            trace!("destroying session parameters {:?}", self.id);
            self.device.destroy_session_parameters(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::H264Pps;
    use crate::codec::h264::H264Sps;
    use crate::codec::h265::H265Vps;
    use crate::codec::ParameterSetPayload;
    use crate::device::emulated::EmulatedDevice;
    use crate::device::SessionCreateFlags;
    use crate::device::SessionCreateInfo;
    use crate::CodecOperation;
    use crate::PictureFormat;
    use crate::Resolution;
    use crate::VideoProfile;

    fn sps(id: u8) -> Rc<StdParameterSet> {
        StdParameterSet::new(
            ParameterSetPayload::H264Sps(H264Sps {
                seq_parameter_set_id: id,
                ..Default::default()
            }),
            0,
        )
    }

    fn pps(id: u8, sps_id: u8) -> Rc<StdParameterSet> {
        StdParameterSet::new(
            ParameterSetPayload::H264Pps(H264Pps {
                pic_parameter_set_id: id,
                seq_parameter_set_id: sps_id,
                ..Default::default()
            }),
            0,
        )
    }

    fn session(device: &Rc<dyn VideoDevice>) -> Rc<VideoSession> {
        VideoSession::create(
            device,
            SessionCreateInfo {
                queue_family: 0,
                flags: SessionCreateFlags::empty(),
                profile: VideoProfile::new(CodecOperation::DecodeH264, 100),
                picture_format: PictureFormat::Nv12,
                max_coded_extent: Resolution {
                    width: 320,
                    height: 240,
                },
                reference_picture_format: PictureFormat::Nv12,
                max_dpb_slots: 17,
                max_active_reference_pictures: 16,
            },
        )
        .unwrap()
    }

    fn setup() -> (Rc<EmulatedDevice>, Rc<dyn VideoDevice>) {
        let emulated = EmulatedDevice::new(Default::default());
        let device: Rc<dyn VideoDevice> = emulated.clone();
        (emulated, device)
    }

    #[test]
    fn id_presence_is_per_kind() {
        let (_, device) = setup();
        let object = SessionParameters::create(&device, None);
        object
            .borrow_mut()
            .add_picture_parameters_to_queue(&sps(3))
            .unwrap();

        let object = object.borrow();
        assert!(object.has_sps_id(3));
        assert!(!object.has_sps_id(4));
        assert!(!object.has_pps_id(3));
        assert!(!object.has_vps_id(3));
        assert!(!object.has_av1_sequence_header());
    }

    #[test]
    fn template_chain_accumulates_ids() {
        let (_, device) = setup();
        let root = SessionParameters::create(&device, None);
        root.borrow_mut()
            .add_picture_parameters_to_queue(&sps(0))
            .unwrap();
        let child = SessionParameters::create(&device, Some(root.clone()));
        child
            .borrow_mut()
            .add_picture_parameters_to_queue(&pps(1, 0))
            .unwrap();
        let grandchild = SessionParameters::create(&device, Some(child.clone()));
        grandchild
            .borrow_mut()
            .add_picture_parameters_to_queue(&sps(5))
            .unwrap();

        let grandchild = grandchild.borrow();
        assert!(grandchild.has_sps_id(0));
        assert!(grandchild.has_pps_id(1));
        assert!(grandchild.has_sps_id(5));
        assert!(!grandchild.has_pps_id(0));
        assert_eq!(grandchild.parameter_sets().count(), 3);
        // IDs only flow down the chain.
        assert!(!root.borrow().has_sps_id(5));
    }

    #[test]
    fn out_of_range_id() {
        let (_, device) = setup();
        let object = SessionParameters::create(&device, None);
        let err = object
            .borrow_mut()
            .add_picture_parameters_to_queue(&sps(40))
            .unwrap_err();
        assert!(matches!(
            err,
            ParametersError::IdOutOfRange {
                kind: ParameterSetKind::H264Sps,
                id: 40
            }
        ));
        assert_eq!(object.borrow().pending(), 0);
    }

    #[test]
    fn hierarchy_links_parents() {
        let (_, device) = setup();
        let object = SessionParameters::create(&device, None);
        let pps = pps(0, 2);
        let sps = sps(2);
        let mut object = object.borrow_mut();

        // A PPS received before its SPS is linked once the SPS arrives.
        object.add_picture_parameters_to_queue(&pps).unwrap();
        assert!(pps.parent().is_none());
        object.add_picture_parameters_to_queue(&sps).unwrap();
        assert!(Rc::ptr_eq(&pps.parent().unwrap(), &sps));

        let vps = StdParameterSet::new(ParameterSetPayload::H265Vps(H265Vps::default()), 0);
        assert_eq!(object.update_picture_parameters_hierarchy(&vps).unwrap(), true);
        assert_eq!(object.update_picture_parameters_hierarchy(&vps).unwrap(), false);
    }

    #[test]
    fn queue_waits_for_session_then_flushes_in_order() {
        let (emulated, device) = setup();
        let mut current = None;

        assert_eq!(
            SessionParameters::add_picture_parameters(&device, None, &sps(0), &mut current)
                .unwrap(),
            1
        );
        assert_eq!(
            SessionParameters::add_picture_parameters(&device, None, &pps(0, 0), &mut current)
                .unwrap(),
            2
        );
        assert_eq!(emulated.stats().parameters_created, 0);

        let session = session(&device);
        let object = current.clone().unwrap();
        assert_eq!(
            object
                .borrow_mut()
                .flush_picture_parameters_queue(&session)
                .unwrap(),
            2
        );
        assert_eq!(emulated.stats().parameters_created, 1);
        assert_eq!(emulated.stats().parameters_updated, 1);
        assert_eq!(object.borrow().update_count(), 1);

        // With a session, new IDs are added right away.
        assert_eq!(
            SessionParameters::add_picture_parameters(
                &device,
                Some(&session),
                &pps(1, 0),
                &mut current
            )
            .unwrap(),
            0
        );
        assert!(Rc::ptr_eq(current.as_ref().unwrap(), &object));
        assert_eq!(emulated.stats().parameters_updated, 2);
    }

    #[test]
    fn reused_id_starts_a_new_object() {
        let (emulated, device) = setup();
        let session = session(&device);
        let mut current = None;
        for set in [sps(0), pps(0, 0)] {
            SessionParameters::add_picture_parameters(&device, Some(&session), &set, &mut current)
                .unwrap();
        }
        let first = current.clone().unwrap();

        SessionParameters::add_picture_parameters(&device, Some(&session), &sps(0), &mut current)
            .unwrap();
        let second = current.clone().unwrap();
        assert!(!Rc::ptr_eq(&first, &second));
        assert!(second.borrow().has_pps_id(0));
        // The template is released once the new object exists.
        assert!(second.borrow().template().is_none());
        assert_eq!(emulated.stats().parameters_created, 2);

        drop(current);
        drop(second);
        drop(first);
        assert_eq!(emulated.stats().parameters_destroyed, 2);
    }

    #[test]
    fn duplicate_in_queue_is_rejected() {
        let (_, device) = setup();
        let object = SessionParameters::create(&device, None);
        let mut object = object.borrow_mut();
        object.add_picture_parameters_to_queue(&sps(1)).unwrap();
        assert!(matches!(
            object.add_picture_parameters_to_queue(&sps(1)),
            Err(ParametersError::DuplicateId { .. })
        ));
    }

    #[test]
    fn migrate_to_new_session() {
        let (emulated, device) = setup();
        let old_session = session(&device);
        let mut current = None;
        let sets = [sps(0), pps(0, 0)];
        for set in &sets {
            SessionParameters::add_picture_parameters(
                &device,
                Some(&old_session),
                set,
                &mut current,
            )
            .unwrap();
            set.set_client_object(current.clone());
        }
        let old = current.clone().unwrap();

        let new_session = session(&device);
        assert!(!old.borrow().bound_session_matches(&new_session));
        assert!(matches!(
            old.borrow_mut().flush_picture_parameters_queue(&new_session),
            Err(ParametersError::WrongSession)
        ));

        let migrated = SessionParameters::migrate(&old, &new_session).unwrap();
        assert!(migrated.borrow().bound_session_matches(&new_session));
        assert_eq!(migrated.borrow().pending(), 0);
        for set in &sets {
            assert!(Rc::ptr_eq(&set.client_object().unwrap(), &migrated));
        }
        assert_eq!(emulated.stats().parameters_created, 2);

        drop(current);
        drop(old);
        assert_eq!(emulated.stats().parameters_destroyed, 1);
        assert!(sets[0].client_object().is_some());
    }
}
