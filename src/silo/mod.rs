//! The silo: an embedded, transactional, schema-aware resource store.
//!
//! Every mutating operation runs inside exactly one write transaction:
//! validate, read the pre-image, mutate the attribute tree, diff the
//! secondary indices, write the row, commit. The first error aborts the
//! transaction and surfaces unchanged; nothing partially commits.
//!
//! The silo also owns the group ↔ member back-reference upkeep: membership
//! entries on a Group are mirrored into the referenced resources' `groups`
//! attribute, and both directions are scrubbed on delete.

pub mod index;
pub mod patch;
pub mod search;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{mpsc, Arc};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::Utc;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::SiloConfig;
use crate::error::{ScimError, ScimResult};
use crate::filter::Evaluator;
use crate::resource::{Attribute, AttrValue, ComplexAttr, Resource, SimpleAttr, SubAttrMap};
use crate::schema::{ResourceType, SchemaRegistry};
use crate::storage::{KvStore, SnapshotRead, WriteTxn};

use index::{
    bump_count, read_count, Index, BUC_COUNTS, BUC_INDICES, BUC_RESOURCES, PRESENCE_INDEX,
    RES_INDEX_DELIM, SYSTEM_SUFFIX,
};
pub use patch::{PatchEngine, PatchOpKind, PatchOperation, PatchRequest};
pub use search::SearchContext;

/// The embedded resource store.
pub struct Silo {
    store: KvStore,
    registry: Arc<SchemaRegistry>,
    /// Names of the stored resource types.
    resources: HashMap<String, String>,
    /// Per-resource-type attribute indices, keyed by lowercase path.
    indices: HashMap<String, HashMap<String, Index>>,
    /// Per-resource-type system indices (presence).
    sys_indices: HashMap<String, HashMap<String, Index>>,
}

impl Silo {
    /// Opens the store at `path`, creating resource and index buckets for
    /// every configured resource type and pruning buckets that config no
    /// longer mentions (system indices are preserved).
    pub fn open(
        path: impl AsRef<Path>,
        config: &SiloConfig,
        registry: Arc<SchemaRegistry>,
    ) -> ScimResult<Self> {
        let store = KvStore::open(path)?;
        let mut resources = HashMap::new();
        let mut indices: HashMap<String, HashMap<String, Index>> = HashMap::new();
        let mut sys_indices: HashMap<String, HashMap<String, Index>> = HashMap::new();

        let txn = store.begin_write()?;
        let setup = Self::open_in_txn(
            &txn,
            config,
            &registry,
            &mut resources,
            &mut indices,
            &mut sys_indices,
        );
        match setup {
            Ok(()) => txn.commit()?,
            Err(e) => {
                txn.abort();
                return Err(e);
            }
        }

        Ok(Self {
            store,
            registry,
            resources,
            indices,
            sys_indices,
        })
    }

    fn open_in_txn(
        txn: &WriteTxn,
        config: &SiloConfig,
        registry: &SchemaRegistry,
        resources: &mut HashMap<String, String>,
        indices: &mut HashMap<String, HashMap<String, Index>>,
        sys_indices: &mut HashMap<String, HashMap<String, Index>>,
    ) -> ScimResult<()> {
        txn.ensure_bucket(BUC_RESOURCES)?;
        txn.ensure_bucket(BUC_INDICES)?;
        txn.ensure_bucket(BUC_COUNTS)?;

        for rc in &config.resources {
            let rt = registry.require_resource_type(&rc.name)?;
            info!("creating bucket for resource {}", rt.name);
            txn.ensure_bucket(&rt.name)?;
            txn.put(BUC_RESOURCES, rt.name.as_bytes(), &[])?;
            resources.insert(rt.name.clone(), rt.name.clone());
            let res_idx = indices.entry(rt.name.clone()).or_default();

            // Unique attributes are always indexed; that is what makes the
            // insert-time uniqueness check cheap.
            let mut fields: Vec<String> =
                rc.index_fields.iter().map(|f| f.to_lowercase()).collect();
            for unique in registry.unique_attribute_paths(rt) {
                if !fields.contains(&unique) {
                    fields.push(unique);
                }
            }

            for field in fields {
                let bound = match registry.resolve(rt, &field) {
                    Ok(b) => b,
                    Err(_) => {
                        warn!(
                            "there is no attribute {} on {}, index not created",
                            field, rt.name
                        );
                        continue;
                    }
                };
                if bound.def.is_complex() {
                    warn!(
                        "attribute {} of {} is complex, index the sub-attribute instead",
                        field, rt.name
                    );
                    continue;
                }
                // Only unique single-valued attributes get the fail-fast
                // one-value-per-key shape; any other index maps a value to
                // the set of resources carrying it.
                let allow_dup = bound.allow_dup_key() || !bound.def.is_unique();
                let idx = Index::new(
                    &rt.name,
                    &field,
                    bound.value_type(),
                    bound.def.case_exact,
                    allow_dup,
                    false,
                );
                if idx.allow_dup_key {
                    txn.ensure_dup_bucket(&idx.bucket)?;
                } else {
                    txn.ensure_bucket(&idx.bucket)?;
                }
                idx.save(txn)?;
                res_idx.insert(idx.name.clone(), idx);
            }

            let pr = Index::presence(&rt.name);
            txn.ensure_dup_bucket(&pr.bucket)?;
            pr.save(txn)?;
            sys_indices
                .entry(rt.name.clone())
                .or_default()
                .insert(PRESENCE_INDEX.to_string(), pr);
        }

        Self::prune_stale_buckets(txn, resources, indices)
    }

    /// Drops resource and index buckets that are no longer configured.
    fn prune_stale_buckets(
        txn: &WriteTxn,
        resources: &HashMap<String, String>,
        indices: &HashMap<String, HashMap<String, Index>>,
    ) -> ScimResult<()> {
        let mut stale_resources = Vec::new();
        txn.for_each(BUC_RESOURCES, &mut |k, _| {
            let name = String::from_utf8_lossy(k).into_owned();
            if !resources.contains_key(&name) {
                stale_resources.push(name);
            }
            Ok(())
        })?;
        for name in stale_resources {
            info!("deleting unused bucket of resource {}", name);
            txn.delete(BUC_RESOURCES, name.as_bytes())?;
            txn.drop_bucket(&name)?;
            txn.delete(BUC_COUNTS, name.as_bytes())?;
        }

        let mut stale_indices: Vec<(String, bool)> = Vec::new();
        txn.for_each(BUC_INDICES, &mut |k, v| {
            let bucket = String::from_utf8_lossy(k).into_owned();
            let Some((res_name, idx_name)) = bucket.split_once(RES_INDEX_DELIM) else {
                return Ok(());
            };
            if idx_name.ends_with(SYSTEM_SUFFIX) {
                return Ok(());
            }
            let live = indices
                .get(res_name)
                .map(|m| m.contains_key(idx_name))
                .unwrap_or(false);
            if !live {
                let dup = serde_json::from_slice::<Index>(v)
                    .map(|idx| idx.allow_dup_key)
                    .unwrap_or(false);
                stale_indices.push((bucket, dup));
            }
            Ok(())
        })?;
        for (bucket, dup) in stale_indices {
            info!("deleting unused index bucket {}", bucket);
            txn.delete(BUC_INDICES, bucket.as_bytes())?;
            if dup {
                txn.drop_dup_bucket(&bucket)?;
            } else {
                txn.drop_bucket(&bucket)?;
            }
            txn.delete(BUC_COUNTS, bucket.as_bytes())?;
            let prefix = format!("{}{}", bucket, RES_INDEX_DELIM).into_bytes();
            let mut stale_counts = Vec::new();
            txn.for_each(BUC_COUNTS, &mut |k, _| {
                if k.starts_with(&prefix) {
                    stale_counts.push(k.to_vec());
                }
                Ok(())
            })?;
            for key in stale_counts {
                txn.delete(BUC_COUNTS, &key)?;
            }
        }
        Ok(())
    }

    /// Closes the store. Pending readers finish against their snapshots.
    pub fn close(self) {
        info!("closing silo");
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Total number of live resources of a type.
    pub fn resource_count(&self, rt_name: &str) -> ScimResult<i64> {
        let read = self.store.begin_read()?;
        read_count(&read, rt_name.as_bytes())
    }

    /// Total number of tuples in one attribute index.
    pub fn index_total(&self, rt_name: &str, attr_path: &str) -> ScimResult<i64> {
        let idx = self.require_index(rt_name, &attr_path.to_lowercase())?;
        let read = self.store.begin_read()?;
        idx.total_count(&read)
    }

    /// Whether an index holds the given value; test and introspection hook.
    pub fn index_has_val(&self, rt_name: &str, attr_path: &str, val: &AttrValue) -> ScimResult<bool> {
        let idx = self.require_index(rt_name, &attr_path.to_lowercase())?;
        let read = self.store.begin_read()?;
        idx.has_val(&read, val)
    }

    fn require_index(&self, rt_name: &str, path: &str) -> ScimResult<&Index> {
        self.indices
            .get(rt_name)
            .and_then(|m| m.get(path))
            .ok_or_else(|| {
                ScimError::internal(format!("no index on {} for {}", path, rt_name))
            })
    }

    fn require_stored(&self, rt_name: &str) -> ScimResult<()> {
        if self.resources.contains_key(rt_name) {
            Ok(())
        } else {
            Err(ScimError::not_found(format!(
                "resource type {} is not stored here",
                rt_name
            )))
        }
    }

    // ------------------------------------------------------------------
    // Insert
    // ------------------------------------------------------------------

    /// Creates a resource: strips readonly attributes, assigns a fresh id,
    /// stamps meta, enforces uniqueness, writes the row and every index
    /// tuple, and mirrors group memberships.
    pub fn insert(&self, res: Resource) -> ScimResult<Resource> {
        let rt = self.registry.require_resource_type(res.resource_type())?;
        self.require_stored(&rt.name)?;

        let mut res = res;
        res.remove_read_only(&self.registry, rt);
        res.check_required(&self.registry, rt)?;
        res.check_primary_flags()?;

        let rid = Uuid::new_v4().to_string();
        res.set_id(&rid);
        res.stamp_meta(now_millis());

        let txn = self.store.begin_write()?;
        match self.insert_in_txn(&txn, &res, &rid, rt) {
            Ok(()) => {
                txn.commit()?;
                debug!("successfully inserted resource with id {}", rid);
                Ok(res)
            }
            Err(e) => {
                txn.abort();
                debug!("failed to insert resource: {}", e);
                Err(e)
            }
        }
    }

    fn insert_in_txn(
        &self,
        txn: &WriteTxn,
        res: &Resource,
        rid: &str,
        rt: &ResourceType,
    ) -> ScimResult<()> {
        self.check_uniqueness(txn, res, rt, None)?;
        self.diff_indices(txn, &rt.name, rid, None, Some(res))?;
        self.store_row(txn, &rt.name, rid, res)?;
        bump_count(txn, rt.name.as_bytes(), 1)?;
        if rt.name == "Group" {
            self.sync_member_backrefs(txn, None, Some(res), rid, rt)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Get / Delete
    // ------------------------------------------------------------------

    /// Reads a resource from a committed snapshot.
    pub fn get(&self, rid: &str, rt_name: &str) -> ScimResult<Resource> {
        let rt = self.registry.require_resource_type(rt_name)?;
        self.require_stored(&rt.name)?;
        let read = self.store.begin_read()?;
        self.load(&read, &rt.name, rid)
    }

    fn load(&self, txn: &impl SnapshotRead, rt_name: &str, rid: &str) -> ScimResult<Resource> {
        match txn.get(rt_name, rid.as_bytes())? {
            Some(data) => Resource::from_bytes(&data, rt_name),
            None => Err(ScimError::not_found(format!(
                "{} resource with ID {} not found",
                rt_name, rid
            ))),
        }
    }

    /// Deletes a resource, its index tuples, and its membership mirrors.
    pub fn delete(&self, rid: &str, rt_name: &str) -> ScimResult<()> {
        let rt = self.registry.require_resource_type(rt_name)?;
        self.require_stored(&rt.name)?;

        let txn = self.store.begin_write()?;
        match self.delete_in_txn(&txn, rid, rt) {
            Ok(()) => {
                txn.commit()?;
                debug!("successfully removed resource with id {}", rid);
                Ok(())
            }
            Err(e) => {
                txn.abort();
                debug!("failed to remove resource {}: {}", rid, e);
                Err(e)
            }
        }
    }

    fn delete_in_txn(&self, txn: &WriteTxn, rid: &str, rt: &ResourceType) -> ScimResult<()> {
        let res = self.load(txn, &rt.name, rid)?;
        self.diff_indices(txn, &rt.name, rid, Some(&res), None)?;
        txn.delete(&rt.name, rid.as_bytes())?;
        bump_count(txn, rt.name.as_bytes(), -1)?;

        // Scrub both directions of the membership graph.
        if rt.name == "Group" {
            for member in member_refs(&res) {
                self.remove_groups_backref(txn, &member.rid, member.type_hint.as_deref(), rid)?;
            }
        }
        for gid in res.values_at("groups.value") {
            if let Some(gid) = gid.as_str() {
                self.remove_member_entry(txn, gid, rid)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Replace / Patch
    // ------------------------------------------------------------------

    /// Full overwrite of an existing resource, with index diffing and
    /// uniqueness enforcement. Server-managed attributes (`meta`, `groups`)
    /// are carried over from the stored version.
    pub fn replace(&self, res: Resource) -> ScimResult<Resource> {
        let rt = self.registry.require_resource_type(res.resource_type())?;
        self.require_stored(&rt.name)?;
        let rid = res
            .id()
            .ok_or_else(|| ScimError::invalid_value("replace requires an id"))?
            .to_string();

        let mut incoming = res;
        incoming.remove_read_only(&self.registry, rt);
        incoming.check_required(&self.registry, rt)?;
        incoming.check_primary_flags()?;

        let txn = self.store.begin_write()?;
        match self.replace_in_txn(&txn, &rid, incoming, rt) {
            Ok(updated) => {
                txn.commit()?;
                Ok(updated)
            }
            Err(e) => {
                txn.abort();
                Err(e)
            }
        }
    }

    fn replace_in_txn(
        &self,
        txn: &WriteTxn,
        rid: &str,
        mut incoming: Resource,
        rt: &ResourceType,
    ) -> ScimResult<Resource> {
        let old_bytes = txn
            .get(&rt.name, rid.as_bytes())?
            .ok_or_else(|| {
                ScimError::not_found(format!("{} resource with ID {} not found", rt.name, rid))
            })?;
        let old = Resource::from_bytes(&old_bytes, &rt.name)?;

        incoming.set_id(rid);
        // Server-managed attributes survive a replace untouched.
        for schema in self.registry.schemas_for(rt) {
            for at in &schema.attributes {
                if at.is_read_only() && !at.name.eq_ignore_ascii_case("id") {
                    if let Some(existing) = old.get_attr(&at.name) {
                        incoming.set_attr(None, existing.clone());
                    }
                }
            }
        }

        if incoming.to_bytes()? == old_bytes {
            debug!("replace is a no-op for {}", rid);
            return Ok(old);
        }

        self.check_uniqueness(txn, &incoming, rt, Some(rid))?;
        incoming.touch_meta(next_millis(old.meta_last_modified()));
        self.diff_indices(txn, &rt.name, rid, Some(&old), Some(&incoming))?;
        self.store_row(txn, &rt.name, rid, &incoming)?;
        if rt.name == "Group" {
            self.sync_member_backrefs(txn, Some(&old), Some(&incoming), rid, rt)?;
        }
        Ok(incoming)
    }

    /// Applies a validated patch request. When the operations leave the
    /// stored bytes unchanged the resource is returned as-is: no meta bump,
    /// no index writes.
    pub fn patch(&self, rid: &str, req: &PatchRequest, rt_name: &str) -> ScimResult<Resource> {
        let rt = self.registry.require_resource_type(rt_name)?;
        self.require_stored(&rt.name)?;

        let txn = self.store.begin_write()?;
        match self.patch_in_txn(&txn, rid, req, rt) {
            Ok(updated) => {
                txn.commit()?;
                Ok(updated)
            }
            Err(e) => {
                txn.abort();
                debug!("failed to patch resource {}: {}", rid, e);
                Err(e)
            }
        }
    }

    fn patch_in_txn(
        &self,
        txn: &WriteTxn,
        rid: &str,
        req: &PatchRequest,
        rt: &ResourceType,
    ) -> ScimResult<Resource> {
        let old_bytes = txn
            .get(&rt.name, rid.as_bytes())?
            .ok_or_else(|| {
                ScimError::not_found(format!("{} resource with ID {} not found", rt.name, rid))
            })?;
        let old = Resource::from_bytes(&old_bytes, &rt.name)?;

        let mut updated = old.clone();
        PatchEngine::new(&self.registry, rt).apply(&mut updated, req)?;

        if updated.to_bytes()? == old_bytes {
            debug!("patch left resource {} unchanged", rid);
            return Ok(old);
        }

        self.check_uniqueness(txn, &updated, rt, Some(rid))?;
        updated.touch_meta(next_millis(old.meta_last_modified()));
        self.diff_indices(txn, &rt.name, rid, Some(&old), Some(&updated))?;
        self.store_row(txn, &rt.name, rid, &updated)?;
        if rt.name == "Group" {
            self.sync_member_backrefs(txn, Some(&old), Some(&updated), rid, rt)?;
        }
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Runs a search and materializes the hits.
    pub fn search(&self, sc: &SearchContext) -> ScimResult<Vec<Resource>> {
        let (tx, rx) = mpsc::channel();
        self.search_into(sc, tx)?;
        Ok(rx.into_iter().collect())
    }

    /// Streams matching resources to `out` in arrival order. A dropped
    /// receiver silently discards the remaining hits.
    pub fn search_into(&self, sc: &SearchContext, out: mpsc::Sender<Resource>) -> ScimResult<()> {
        let read = self.store.begin_read()?;
        for rt_name in &sc.res_types {
            let rt = self.registry.require_resource_type(rt_name)?;
            self.require_stored(&rt.name)?;
            let idx_map = self
                .indices
                .get(&rt.name)
                .ok_or_else(|| ScimError::internal(format!("no indices for {}", rt.name)))?;
            let presence = self
                .sys_indices
                .get(&rt.name)
                .and_then(|m| m.get(PRESENCE_INDEX))
                .ok_or_else(|| {
                    ScimError::internal(format!("no presence index for {}", rt.name))
                })?;
            let evaluator = Evaluator::new(&self.registry, rt);

            match search::candidate_rids(&sc.filter, idx_map, presence, &read)? {
                Some(rids) => {
                    for rid in rids {
                        if let Some(data) = read.get(&rt.name, rid.as_bytes())? {
                            let rs = Resource::from_bytes(&data, &rt.name)?;
                            if evaluator.evaluate(&sc.filter, &rs) {
                                let _ = out.send(rs);
                            }
                        }
                    }
                }
                None => {
                    debug!("scanning complete bucket of {} for search results", rt.name);
                    read.for_each(&rt.name, &mut |_, v| {
                        let rs = Resource::from_bytes(v, &rt.name)?;
                        if evaluator.evaluate(&sc.filter, &rs) {
                            let _ = out.send(rs);
                        }
                        Ok(())
                    })?;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Authenticate
    // ------------------------------------------------------------------

    /// Resolves the user through the `username` index and verifies the
    /// password against the stored value (`{sha256}`-prefixed digests or
    /// plain comparison). Every failure mode is `forbidden`.
    pub fn authenticate(&self, username: &str, password: &str) -> ScimResult<Resource> {
        let idx = self
            .require_index("User", "username")
            .map_err(|_| ScimError::forbidden("authentication is not available"))?;
        let read = self.store.begin_read()?;

        let rid = idx
            .get_rid(&read, &AttrValue::String(username.to_string()))?
            .ok_or_else(|| ScimError::forbidden("invalid credentials"))?;
        let user = self
            .load(&read, "User", &rid)
            .map_err(|_| ScimError::forbidden("invalid credentials"))?;

        let stored = user
            .values_at("password")
            .into_iter()
            .next()
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| ScimError::forbidden("invalid credentials"))?;
        if !verify_password(&stored, password) {
            return Err(ScimError::forbidden("invalid credentials"));
        }
        if user.values_at("active").first() == Some(&AttrValue::Boolean(false)) {
            return Err(ScimError::forbidden("account is disabled"));
        }

        let mut user = user;
        user.remove_attr("password");
        Ok(user)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn store_row(
        &self,
        txn: &WriteTxn,
        rt_name: &str,
        rid: &str,
        res: &Resource,
    ) -> ScimResult<()> {
        let data = res.to_bytes()?;
        txn.put(rt_name, rid.as_bytes(), &data)
    }

    /// Rejects values already owned by another resource on any unique
    /// attribute path of the type.
    fn check_uniqueness(
        &self,
        txn: &WriteTxn,
        res: &Resource,
        rt: &ResourceType,
        exclude_rid: Option<&str>,
    ) -> ScimResult<()> {
        for path in self.registry.unique_attribute_paths(rt) {
            let Some(idx) = self.indices.get(&rt.name).and_then(|m| m.get(&path)) else {
                continue;
            };
            for val in res.values_at(&path) {
                let owners = if idx.allow_dup_key {
                    idx.get_rids(txn, &val)?
                } else {
                    idx.get_rid(txn, &val)?.into_iter().collect()
                };
                if owners.iter().any(|o| Some(o.as_str()) != exclude_rid) {
                    return Err(ScimError::uniqueness(format!(
                        "value {} of attribute {} already exists",
                        val.count_key(),
                        path
                    )));
                }
            }
        }
        Ok(())
    }

    /// Converges the indices of one resource from `old` to `new`. Passing
    /// `None` for either side covers insert and delete.
    fn diff_indices(
        &self,
        txn: &WriteTxn,
        rt_name: &str,
        rid: &str,
        old: Option<&Resource>,
        new: Option<&Resource>,
    ) -> ScimResult<()> {
        let Some(idx_map) = self.indices.get(rt_name) else {
            return Ok(());
        };
        let presence = self
            .sys_indices
            .get(rt_name)
            .and_then(|m| m.get(PRESENCE_INDEX));

        for (name, idx) in idx_map {
            let old_vals = old.map(|r| r.values_at(name)).unwrap_or_default();
            let new_vals = new.map(|r| r.values_at(name)).unwrap_or_default();

            // Multiset difference: unchanged values keep their tuples.
            let mut new_used = vec![false; new_vals.len()];
            let mut removed = Vec::new();
            for ov in &old_vals {
                let matched = new_vals
                    .iter()
                    .enumerate()
                    .find(|(i, nv)| !new_used[*i] && ov.matches(nv, idx.case_sensitive));
                match matched {
                    Some((i, _)) => new_used[i] = true,
                    None => removed.push(ov),
                }
            }
            for v in removed {
                idx.remove(txn, v, rid)?;
            }
            for (i, v) in new_vals.iter().enumerate() {
                if !new_used[i] {
                    idx.add(txn, v, rid)?;
                }
            }

            if let Some(pr) = presence {
                let path_key = AttrValue::String(name.clone());
                if !old_vals.is_empty() && new_vals.is_empty() {
                    pr.remove(txn, &path_key, rid)?;
                } else if old_vals.is_empty() && !new_vals.is_empty() {
                    pr.add(txn, &path_key, rid)?;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Group ↔ member back-references
    // ------------------------------------------------------------------

    /// Converges the `groups` mirrors of referenced resources with the
    /// member set of a group, for any combination of old/new group images.
    fn sync_member_backrefs(
        &self,
        txn: &WriteTxn,
        old: Option<&Resource>,
        new: Option<&Resource>,
        gid: &str,
        rt: &ResourceType,
    ) -> ScimResult<()> {
        let old_members = old.map(member_refs).unwrap_or_default();
        let new_members = new.map(member_refs).unwrap_or_default();
        let display = new
            .and_then(|r| r.values_at("displayname").into_iter().next())
            .and_then(|v| v.as_str().map(str::to_string));

        for member in &new_members {
            if !old_members.iter().any(|m| m.rid == member.rid) {
                self.add_groups_backref(txn, member, gid, rt, display.as_deref())?;
            }
        }
        for member in &old_members {
            if !new_members.iter().any(|m| m.rid == member.rid) {
                self.remove_groups_backref(txn, &member.rid, member.type_hint.as_deref(), gid)?;
            }
        }
        Ok(())
    }

    /// Appends a `groups` entry on the referenced resource.
    fn add_groups_backref(
        &self,
        txn: &WriteTxn,
        member: &MemberRef,
        gid: &str,
        group_rt: &ResourceType,
        display: Option<&str>,
    ) -> ScimResult<()> {
        let Some((rt_name, target)) =
            self.resolve_ref(txn, &member.rid, member.type_hint.as_deref())?
        else {
            return Err(ScimError::invalid_value(format!(
                "there is no resource with the referenced value {}",
                member.rid
            )));
        };

        if target
            .values_at("groups.value")
            .iter()
            .any(|v| v.as_str() == Some(gid))
        {
            return Ok(());
        }

        let old = target.clone();
        let mut target = target;
        let entry = groups_entry(gid, &group_rt.endpoint, display);
        match target.get_attr_mut("groups") {
            Some(Attribute::Complex(ca)) => ca.sub_ats.push(entry),
            _ => {
                let mut ca = ComplexAttr::new("groups");
                ca.sub_ats.push(entry);
                target.set_attr(None, Attribute::Complex(ca));
            }
        }
        target.touch_meta(next_millis(target.meta_last_modified()));
        self.diff_indices(txn, &rt_name, &member.rid, Some(&old), Some(&target))?;
        self.store_row(txn, &rt_name, &member.rid, &target)
    }

    /// Removes the `groups` entry for `gid` from the referenced resource.
    fn remove_groups_backref(
        &self,
        txn: &WriteTxn,
        member_rid: &str,
        type_hint: Option<&str>,
        gid: &str,
    ) -> ScimResult<()> {
        let Some((rt_name, target)) = self.resolve_ref(txn, member_rid, type_hint)? else {
            warn!(
                "member {} referenced by group {} no longer exists",
                member_rid, gid
            );
            return Ok(());
        };

        let old = target.clone();
        let mut target = target;
        let mut changed = false;
        let mut now_empty = false;
        if let Some(Attribute::Complex(ca)) = target.get_attr_mut("groups") {
            let before = ca.sub_ats.len();
            ca.sub_ats.retain(|entry| {
                entry
                    .get("value")
                    .and_then(|sa| sa.first())
                    .and_then(|v| v.as_str())
                    != Some(gid)
            });
            changed = ca.sub_ats.len() != before;
            now_empty = ca.sub_ats.is_empty();
        }
        if !changed {
            return Ok(());
        }
        if now_empty {
            target.remove_attr("groups");
        }
        target.touch_meta(next_millis(target.meta_last_modified()));
        self.diff_indices(txn, &rt_name, member_rid, Some(&old), Some(&target))?;
        self.store_row(txn, &rt_name, member_rid, &target)
    }

    /// Removes a deleted resource from a group's member list.
    fn remove_member_entry(&self, txn: &WriteTxn, gid: &str, member_rid: &str) -> ScimResult<()> {
        let Some((rt_name, group)) = self.resolve_ref(txn, gid, Some("Group"))? else {
            return Ok(());
        };

        let old = group.clone();
        let mut group = group;
        let mut changed = false;
        let mut now_empty = false;
        if let Some(Attribute::Complex(ca)) = group.get_attr_mut("members") {
            let before = ca.sub_ats.len();
            ca.sub_ats.retain(|entry| {
                entry
                    .get("value")
                    .and_then(|sa| sa.first())
                    .and_then(|v| v.as_str())
                    != Some(member_rid)
            });
            changed = ca.sub_ats.len() != before;
            now_empty = ca.sub_ats.is_empty();
        }
        if !changed {
            return Ok(());
        }
        if now_empty {
            group.remove_attr("members");
        }
        group.touch_meta(next_millis(group.meta_last_modified()));
        self.diff_indices(txn, &rt_name, gid, Some(&old), Some(&group))?;
        self.store_row(txn, &rt_name, gid, &group)
    }

    /// Resolves a referenced resource id: the `type` hint narrows the probe,
    /// otherwise every stored bucket is tried. A reference is never assumed
    /// to be a Group just because the hint is absent.
    fn resolve_ref(
        &self,
        txn: &WriteTxn,
        rid: &str,
        type_hint: Option<&str>,
    ) -> ScimResult<Option<(String, Resource)>> {
        if let Some(hint) = type_hint {
            if self.resources.contains_key(hint) {
                return match txn.get(hint, rid.as_bytes())? {
                    Some(data) => Ok(Some((hint.to_string(), Resource::from_bytes(&data, hint)?))),
                    None => Ok(None),
                };
            }
        }
        for rt_name in self.resources.keys() {
            if let Some(data) = txn.get(rt_name, rid.as_bytes())? {
                return Ok(Some((
                    rt_name.clone(),
                    Resource::from_bytes(&data, rt_name)?,
                )));
            }
        }
        Ok(None)
    }
}

/// One member reference of a group.
struct MemberRef {
    rid: String,
    type_hint: Option<String>,
}

fn member_refs(group: &Resource) -> Vec<MemberRef> {
    let mut out = Vec::new();
    if let Some(Attribute::Complex(ca)) = group.get_attr("members") {
        for entry in &ca.sub_ats {
            let value = entry
                .get("value")
                .and_then(|sa| sa.first())
                .and_then(|v| v.as_str());
            if let Some(rid) = value {
                let type_hint = entry
                    .get("type")
                    .and_then(|sa| sa.first())
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                out.push(MemberRef {
                    rid: rid.to_string(),
                    type_hint,
                });
            }
        }
    }
    out
}

fn groups_entry(gid: &str, group_endpoint: &str, display: Option<&str>) -> SubAttrMap {
    let mut entry = SubAttrMap::new();
    entry.insert(
        "value".to_string(),
        SimpleAttr::single("value", AttrValue::String(gid.to_string())),
    );
    entry.insert(
        "$ref".to_string(),
        SimpleAttr::single(
            "$ref",
            AttrValue::Reference(format!("{}/{}", group_endpoint, gid)),
        ),
    );
    entry.insert(
        "type".to_string(),
        SimpleAttr::single("type", AttrValue::String("direct".to_string())),
    );
    if let Some(display) = display {
        entry.insert(
            "display".to_string(),
            SimpleAttr::single("display", AttrValue::String(display.to_string())),
        );
    }
    entry
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// The next `lastModified` stamp: strictly greater than the previous one.
fn next_millis(prev: Option<i64>) -> i64 {
    let now = now_millis();
    match prev {
        Some(p) if now <= p => p + 1,
        _ => now,
    }
}

fn verify_password(stored: &str, given: &str) -> bool {
    match stored.strip_prefix("{sha256}") {
        Some(digest) => B64.encode(Sha256::digest(given.as_bytes())) == digest,
        None => stored == given,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_password_digest_and_plain() {
        let digest = B64.encode(Sha256::digest(b"secret"));
        let stored = format!("{{sha256}}{}", digest);
        assert!(verify_password(&stored, "secret"));
        assert!(!verify_password(&stored, "wrong"));
        assert!(verify_password("plain", "plain"));
        assert!(!verify_password("plain", "other"));
    }

    #[test]
    fn test_next_millis_is_strictly_monotonic() {
        let far_future = now_millis() + 1_000_000;
        assert_eq!(next_millis(Some(far_future)), far_future + 1);
        assert!(next_millis(None) > 0);
    }
}
