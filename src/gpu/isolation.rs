//! IOMMU group isolation checks for GPU passthrough.
//!
//! A group is usable for VFIO passthrough only when handing it to a guest
//! hands over nothing but one GPU and the functions that belong to it:
//!
//! 1. exactly one VGA function,
//! 2. at most one audio function, and the GPU must be its supplier,
//! 3. optionally (relaxed policy) at most one PCI bridge, which must be the
//!    GPU's direct parent; it stays with the host,
//! 4. nothing else.
//!
//! Any violation rejects the whole group. Groups without a GPU are ignored.

use crate::errors::{PciError, PciResult};
use crate::gpu::iommu::IommuTopology;
use crate::gpu::pci::{DeviceClass, PciAddress, PciDirectory};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationPolicy {
    /// Let the GPU's upstream PCI bridge share its IOMMU group.
    pub allow_bridge_in_group: bool,
}

impl IsolationPolicy {
    pub fn strict() -> Self {
        Self { allow_bridge_in_group: false }
    }

    pub fn relaxed() -> Self {
        Self { allow_bridge_in_group: true }
    }
}

/// A GPU that can be passed through together with its own functions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompatibleGpu {
    pub description: String,
    /// Address of the VGA function, used to refer to the card.
    pub slot: PciAddress,
    /// Functions to hand to the guest: the VGA function, then its audio function.
    pub devices: Vec<PciAddress>,
    /// `vendor:device` ids of `devices`, comma separated, in the same order.
    pub vfio: String,
    pub iommu_group: u32,
}

/// A group that holds a GPU but cannot be passed through as is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BadIsolationGroup {
    pub group_id: u32,
    /// Descriptions of every member of the group.
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupVerdict {
    NoGpu,
    Compatible(CompatibleGpu),
    BadIsolation(BadIsolationGroup),
}

/// Outcome of classifying every IOMMU group on the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub compatible: Vec<CompatibleGpu>,
    pub bad_isolation: BTreeMap<u32, BadIsolationGroup>,
    /// Groups with a member that could not be read, with the error message.
    pub unreadable: BTreeMap<u32, String>,
}

impl Classification {
    pub fn has_compatible(&self) -> bool {
        !self.compatible.is_empty()
    }
}

/// Why a group was rejected. Only logged; callers get the member list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    UnrelatedDevice,
    MultipleBridges,
    MultipleAudio,
    MultipleGpus,
    BridgeNotParent,
    AudioNotSupplied,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Rejection::UnrelatedDevice => "unrelated device shares the group",
            Rejection::MultipleBridges => "more than one PCI bridge",
            Rejection::MultipleAudio => "more than one audio device",
            Rejection::MultipleGpus => "more than one GPU",
            Rejection::BridgeNotParent => "PCI bridge is not the GPU's parent",
            Rejection::AudioNotSupplied => "audio device is not supplied by the GPU",
        };
        f.write_str(reason)
    }
}

/// Group members sorted by the classes the policy allows.
#[derive(Debug, Default)]
struct Buckets {
    display: Vec<PciAddress>,
    audio: Vec<PciAddress>,
    bridge: Vec<PciAddress>,
    disallowed: Vec<PciAddress>,
}

pub struct IsolationClassifier<'a, D: ?Sized, T: ?Sized> {
    directory: &'a D,
    topology: &'a T,
    policy: IsolationPolicy,
}

impl<'a, D, T> IsolationClassifier<'a, D, T>
where
    D: PciDirectory + ?Sized,
    T: IommuTopology + ?Sized,
{
    pub fn new(directory: &'a D, topology: &'a T, policy: IsolationPolicy) -> Self {
        Self { directory, topology, policy }
    }

    /// Classify every group the topology lists.
    pub fn classify_all(&self) -> PciResult<Classification> {
        let groups = self.topology.list_groups()?;
        self.classify_groups(&groups)
    }

    /// Classify the given groups.
    ///
    /// A device that cannot be read marks only its group as unreadable.
    /// Failing to enumerate a group, or a malformed bridge address, means the
    /// topology source is broken and aborts the pass.
    pub fn classify_groups(&self, groups: &[u32]) -> PciResult<Classification> {
        let mut result = Classification::default();

        for &group_id in groups {
            let members = self.topology.members_of(group_id)?;
            match self.classify_members(group_id, &members) {
                Ok(GroupVerdict::NoGpu) => {}
                Ok(GroupVerdict::Compatible(gpu)) => result.compatible.push(gpu),
                Ok(GroupVerdict::BadIsolation(bad)) => {
                    result.bad_isolation.insert(group_id, bad);
                }
                Err(e) if e.is_device_scoped() => {
                    warn!(group_id, error = %e, "Cannot read IOMMU group member");
                    result.unreadable.insert(group_id, e.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            groups = groups.len(),
            compatible = result.compatible.len(),
            bad_isolation = result.bad_isolation.len(),
            unreadable = result.unreadable.len(),
            "Classified IOMMU groups"
        );
        Ok(result)
    }

    pub fn classify_group(&self, group_id: u32) -> PciResult<GroupVerdict> {
        let members = self.topology.members_of(group_id)?;
        self.classify_members(group_id, &members)
    }

    fn classify_members(
        &self,
        group_id: u32,
        members: &BTreeSet<PciAddress>,
    ) -> PciResult<GroupVerdict> {
        let buckets = self.bucket(members)?;

        if buckets.display.is_empty() {
            debug!(group_id, "No GPU in group");
            return Ok(GroupVerdict::NoGpu);
        }

        if let Some(rejection) = self.check(&buckets)? {
            info!(group_id, reason = %rejection, "GPU group has bad isolation");
            return Ok(GroupVerdict::BadIsolation(BadIsolationGroup {
                group_id,
                devices: self.describe_all(members)?,
            }));
        }

        // Buckets were validated as singular above.
        let gpu = &buckets.display[0];
        let mut devices = vec![gpu.clone()];
        devices.extend(buckets.audio.first().cloned());

        let vfio = devices
            .iter()
            .map(|address| self.directory.vendor_device_id(address))
            .collect::<PciResult<Vec<_>>>()?
            .join(",");

        let compatible = CompatibleGpu {
            description: self.directory.describe_full(gpu)?,
            slot: gpu.clone(),
            devices,
            vfio,
            iommu_group: group_id,
        };

        debug!(group_id, slot = %compatible.slot, vfio = %compatible.vfio, "Found compatible GPU");
        Ok(GroupVerdict::Compatible(compatible))
    }

    fn bucket(&self, members: &BTreeSet<PciAddress>) -> PciResult<Buckets> {
        let mut buckets = Buckets::default();

        for address in members {
            let bucket = match self.directory.class_of(address)? {
                DeviceClass::Display => &mut buckets.display,
                DeviceClass::Audio => &mut buckets.audio,
                DeviceClass::Bridge if self.policy.allow_bridge_in_group => &mut buckets.bridge,
                DeviceClass::Bridge | DeviceClass::Other(_) => &mut buckets.disallowed,
            };
            bucket.push(address.clone());
        }

        Ok(buckets)
    }

    /// Returns the first isolation rule the group breaks, if any.
    fn check(&self, buckets: &Buckets) -> PciResult<Option<Rejection>> {
        if !buckets.disallowed.is_empty() {
            return Ok(Some(Rejection::UnrelatedDevice));
        }
        if buckets.bridge.len() > 1 {
            return Ok(Some(Rejection::MultipleBridges));
        }
        if buckets.audio.len() > 1 {
            return Ok(Some(Rejection::MultipleAudio));
        }
        if buckets.display.len() > 1 {
            return Ok(Some(Rejection::MultipleGpus));
        }

        let gpu = &buckets.display[0];

        if let Some(bridge) = buckets.bridge.first() {
            if !self.directory.is_bridge_parent_of(bridge, gpu)? {
                return Ok(Some(Rejection::BridgeNotParent));
            }
        }

        if let Some(audio) = buckets.audio.first() {
            if !self.directory.is_supplier_of(gpu, audio)? {
                return Ok(Some(Rejection::AudioNotSupplied));
            }
        }

        Ok(None)
    }

    fn describe_all(&self, members: &BTreeSet<PciAddress>) -> Result<Vec<String>, PciError> {
        members
            .iter()
            .map(|address| self.directory.describe_full(address))
            .collect()
    }
}
