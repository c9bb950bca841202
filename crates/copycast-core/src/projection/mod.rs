//! Structural projection engine.
//!
//! Compiles a client [`RequestSpec`] against a master [`Schema`] into a
//! [`Projection`]: an arena of copy nodes, each mapping a contiguous offset
//! range of the *projected* tree back to one field (or subtree) of the
//! *master* tree, optionally decorated with value filters.
//!
//! Every subsequent operation — offset translation, the master→copy and
//! copy→master synchronization passes, bitmap compression — walks the
//! compiled arena, never the original request.
//!
//! ```text
//! master schema                    projected schema
//! ┌──────────────────┐  compile   ┌──────────────┐
//! │ value            │ ─────────► │ value        │  CopyNode[1]
//! │ alarm {sev,msg}  │  "value,   │ timeStamp {} │  CopyNode[2]
//! │ timeStamp {s,ns} │ timeStamp" └──────────────┘
//! └──────────────────┘
//! ```
//!
//! The compiled structure is immutable; only filter state (e.g. a
//! deadband's last-reported value) and the caller-owned bitmaps mutate, so
//! the synchronization passes take `&mut self` and the caller's record
//! lock serializes them.

mod filter;

pub use filter::{CustomFilter, FieldFilter, FilterFactory, FilterNode, FilterRegistry};

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::bitset::ChangeBitmap;
use crate::request::{OptionError, PvOptions, RequestNode, RequestSpec};
use crate::tree::{FieldDef, FieldType, ScalarType, Schema, TreeInstance, Value};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// CompileError
// ---------------------------------------------------------------------------

/// Configuration error detected during compile.
///
/// Fatal to the one compile call; no partial projection is ever produced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// A requested field does not exist in the master tree.
    #[error("field {path:?} not found in master tree")]
    FieldNotFound {
        /// Dotted path of the missing field.
        path: String,
    },
    /// Sub-fields were requested of a non-container master field.
    #[error("field {path:?} is not a structure and has no sub-fields")]
    NotAStructure {
        /// Dotted path of the offending field.
        path: String,
    },
    /// A union selection named an alternative other than the currently
    /// selected one.
    #[error("union {path:?}: requested alternative {requested:?} but {selected:?} is selected")]
    UnionMismatch {
        /// Dotted path of the union field.
        path: String,
        /// The requested alternative name.
        requested: String,
        /// The currently selected alternative name.
        selected: String,
    },
    /// More than one alternative of a union was requested.
    #[error("union {path:?}: exactly one alternative must be requested")]
    UnionAmbiguous {
        /// Dotted path of the union field.
        path: String,
    },
    /// A reserved option had a malformed value.
    #[error(transparent)]
    BadOption(#[from] OptionError),
}

// ---------------------------------------------------------------------------
// CopyNode
// ---------------------------------------------------------------------------

/// One node of the compiled projection arena.
///
/// A node with no children is a leaf: it mirrors the master field's whole
/// subtree and the two ranges have identical length. Interior nodes cover
/// only the requested children, so their projected range may be smaller
/// than the mirrored master range.
#[derive(Debug)]
struct CopyNode {
    master_offset: usize,
    master_count: usize,
    copy_offset: usize,
    copy_count: usize,
    /// Arena indices of children; empty for leaves.
    children: Vec<usize>,
    options: PvOptions,
    filters: SmallVec<[FieldFilter; 2]>,
}

impl CopyNode {
    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    fn copy_range(&self) -> std::ops::Range<usize> {
        self.copy_offset..self.copy_offset + self.copy_count
    }

    fn master_range(&self) -> std::ops::Range<usize> {
        self.master_offset..self.master_offset + self.master_count
    }

    fn filter_node(&self) -> FilterNode {
        FilterNode {
            copy_offset: self.copy_offset,
            master_offset: self.master_offset,
            field_count: self.copy_count,
        }
    }
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// A compiled projection of a master tree.
pub struct Projection {
    master_schema: Arc<Schema>,
    copy_schema: Arc<Schema>,
    /// Node 0 is the root.
    nodes: Vec<CopyNode>,
    /// Projected offsets whose changes must never be reported
    /// (`ignore=true` fields and their descendants). Built at compile time.
    ignore_mask: ChangeBitmap,
}

impl Projection {
    /// Compiles `request` against the master tree.
    ///
    /// `master` supplies both the schema and the current union selections;
    /// `registry` resolves unreserved options to custom filters.
    ///
    /// # Errors
    ///
    /// Returns a [`CompileError`] on any configuration error. Nothing is
    /// partially constructed.
    pub fn compile(
        master: &TreeInstance,
        request: &RequestSpec,
        registry: &FilterRegistry,
    ) -> Result<Self, CompileError> {
        let master_schema = Arc::clone(master.schema());

        if request.root.children.is_empty() {
            // identity projection: one leaf over the whole master tree
            let (options, rest) = PvOptions::parse(&request.root.options)?;
            let total = master_schema.field_count();
            let filters = make_filters(
                &options,
                &rest,
                registry,
                master_schema.field(0),
                master_schema.field(0).name.as_str(),
            );
            let nodes = vec![CopyNode {
                master_offset: 0,
                master_count: total,
                copy_offset: 0,
                copy_count: total,
                children: Vec::new(),
                options,
                filters,
            }];
            let mut projection = Self {
                copy_schema: Arc::clone(&master_schema),
                master_schema,
                nodes,
                ignore_mask: ChangeBitmap::new(total),
            };
            projection.build_ignore_mask();
            return Ok(projection);
        }

        let mut compiler = Compiler {
            master_schema: &master_schema,
            snapshot: master,
            registry,
            fields: Vec::new(),
            nodes: Vec::new(),
            parents: Vec::new(),
        };

        let (root_options, _rest) = PvOptions::parse(&request.root.options)?;
        let root_name = master_schema.field(0).name.clone();
        compiler.push_field(root_name, FieldType::Structure, None);
        compiler.nodes.push(CopyNode {
            master_offset: 0,
            master_count: master_schema.field_count(),
            copy_offset: 0,
            copy_count: 1, // patched below
            children: Vec::new(),
            options: root_options,
            filters: SmallVec::new(),
        });

        let mut root_children = Vec::new();
        compiler.add_requested(&request.root.children, 0, "", &mut root_children)?;
        compiler.nodes[0].children = root_children;
        compiler.nodes[0].copy_count = compiler.fields.len();
        compiler.fields[0].field_count = compiler.fields.len();

        let total = compiler.fields.len();
        // the compiler borrows master_schema; take its outputs before the move
        let Compiler { fields, nodes, .. } = compiler;
        let mut projection = Self {
            master_schema,
            copy_schema: Schema::from_fields(fields),
            nodes,
            ignore_mask: ChangeBitmap::new(total),
        };
        projection.assert_tiling();
        projection.build_ignore_mask();
        debug!(
            nodes = projection.nodes.len(),
            projected_fields = total,
            "compiled projection"
        );
        Ok(projection)
    }

    /// The master schema this projection was compiled against.
    #[must_use]
    pub fn master_schema(&self) -> &Arc<Schema> {
        &self.master_schema
    }

    /// The projected (copy) schema.
    #[must_use]
    pub fn copy_schema(&self) -> &Arc<Schema> {
        &self.copy_schema
    }

    /// Creates a fresh default-initialized instance of the projected schema.
    #[must_use]
    pub fn new_copy_instance(&self) -> TreeInstance {
        TreeInstance::new(Arc::clone(&self.copy_schema))
    }

    /// Options attached to the request root (`queueSize` and friends).
    #[must_use]
    pub fn root_options(&self) -> &PvOptions {
        &self.nodes[0].options
    }

    /// The compile-time mask of never-notified projected offsets.
    #[must_use]
    pub fn ignore_mask(&self) -> &ChangeBitmap {
        &self.ignore_mask
    }

    // -- offset translation ------------------------------------------------

    /// Maps a master offset to its projected offset, or `None` when the
    /// field is not present in the projection.
    #[must_use]
    pub fn copy_offset(&self, master_offset: usize) -> Option<usize> {
        self.copy_offset_in(0, master_offset)
    }

    fn copy_offset_in(&self, idx: usize, m: usize) -> Option<usize> {
        let node = &self.nodes[idx];
        if !node.master_range().contains(&m) {
            return None;
        }
        if node.is_leaf() {
            return Some(node.copy_offset + (m - node.master_offset));
        }
        if m == node.master_offset {
            return Some(node.copy_offset);
        }
        node.children
            .iter()
            .find_map(|&c| self.copy_offset_in(c, m))
    }

    /// Maps a projected offset back to its master offset — the inverse of
    /// [`Projection::copy_offset`].
    #[must_use]
    pub fn master_offset(&self, copy_offset: usize) -> Option<usize> {
        self.master_offset_in(0, copy_offset)
    }

    fn master_offset_in(&self, idx: usize, c: usize) -> Option<usize> {
        let node = &self.nodes[idx];
        if !node.copy_range().contains(&c) {
            return None;
        }
        if node.is_leaf() {
            return Some(node.master_offset + (c - node.copy_offset));
        }
        if c == node.copy_offset {
            return Some(node.master_offset);
        }
        node.children
            .iter()
            .find_map(|&ch| self.master_offset_in(ch, c))
    }

    // -- synchronization passes --------------------------------------------

    /// Initializes `copy` from `master`: marks every bit set, then performs
    /// an unconditional master→copy transfer for every leaf node.
    pub fn init_copy(
        &mut self,
        copy: &mut TreeInstance,
        master: &TreeInstance,
        bitmap: &mut ChangeBitmap,
    ) {
        bitmap.set_all();
        for idx in 0..self.nodes.len() {
            if !self.nodes[idx].is_leaf() {
                continue;
            }
            if self.run_filters_to_copy(idx, copy, master, bitmap) {
                continue;
            }
            let node = &self.nodes[idx];
            for off in 0..node.copy_count {
                copy.copy_leaf_from(node.copy_offset + off, master, node.master_offset + off);
            }
        }
    }

    /// The master→copy delta pass: copies differing leaf values, setting
    /// their bits in `bitmap`. Ignored offsets are copied but subtracted
    /// from the bitmap, so they never trigger a notification. Returns
    /// whether any non-ignored bit ended up set.
    pub fn update_copy_set_bitset(
        &mut self,
        copy: &mut TreeInstance,
        master: &TreeInstance,
        bitmap: &mut ChangeBitmap,
    ) -> bool {
        for idx in 0..self.nodes.len() {
            if !self.nodes[idx].is_leaf() {
                continue;
            }
            if self.run_filters_to_copy(idx, copy, master, bitmap) {
                continue;
            }
            let node = &self.nodes[idx];
            for off in 0..node.copy_count {
                if copy.copy_leaf_from(node.copy_offset + off, master, node.master_offset + off)
                {
                    bitmap.set(node.copy_offset + off);
                }
            }
        }
        bitmap.subtract(&self.ignore_mask);
        bitmap.any()
    }

    /// The copy-requested-fields pass, used by get-style operations: copies
    /// every leaf whose projected range intersects a set bit,
    /// unconditionally (the caller explicitly asked for those fields).
    ///
    /// Bit 0 means "everything". An interior field's bit means "all of its
    /// descendants"; the bitmap is expanded accordingly, so on return the
    /// full descendant set of every requested subtree is marked.
    pub fn update_copy_from_bitset(
        &mut self,
        copy: &mut TreeInstance,
        master: &TreeInstance,
        bitmap: &mut ChangeBitmap,
    ) {
        if bitmap.get(0) {
            bitmap.set_all();
        } else {
            self.expand_for_read(bitmap);
        }
        self.from_bitset_rec(0, copy, master, bitmap);
    }

    fn from_bitset_rec(
        &mut self,
        idx: usize,
        copy: &mut TreeInstance,
        master: &TreeInstance,
        bitmap: &mut ChangeBitmap,
    ) {
        let (is_leaf, range, children) = {
            let node = &self.nodes[idx];
            (node.is_leaf(), node.copy_range(), node.children.clone())
        };
        // range-prefix check: skip whole untouched subtrees
        if !range.clone().any(|off| bitmap.get(off)) {
            return;
        }
        if is_leaf {
            if self.run_filters_to_copy(idx, copy, master, bitmap) {
                return;
            }
            let node = &self.nodes[idx];
            for off in 0..node.copy_count {
                copy.copy_leaf_from(node.copy_offset + off, master, node.master_offset + off);
            }
        } else {
            for child in children {
                self.from_bitset_rec(child, copy, master, bitmap);
            }
        }
    }

    /// The copy→master delta pass: normalizes interior bits down to leaf
    /// bits, then applies every remaining set bit in ascending order,
    /// clearing bits as it proceeds.
    ///
    /// A per-field type failure marks the master's alarm fields (when
    /// present) and the pass continues with the remaining bits.
    pub fn update_master(
        &mut self,
        copy: &TreeInstance,
        master: &mut TreeInstance,
        bitmap: &mut ChangeBitmap,
    ) {
        self.expand_to_leaves(bitmap);
        let set_bits: Vec<usize> = bitmap.ones().collect();
        for copy_off in set_bits {
            let Some(idx) = self.leaf_node_for(copy_off) else {
                bitmap.clear(copy_off);
                continue;
            };
            let handled = {
                let fnode = self.nodes[idx].filter_node();
                let filters = &mut self.nodes[idx].filters;
                let mut handled = false;
                for f in filters.iter_mut() {
                    if f.to_master(fnode, copy, master, bitmap) {
                        handled = true;
                    }
                }
                handled
            };
            if !handled {
                let node = &self.nodes[idx];
                let master_off = node.master_offset + (copy_off - node.copy_offset);
                if let Err(e) = master.set(master_off, copy.get(copy_off).clone()) {
                    warn!(master_offset = master_off, error = %e, "put copy failed");
                    mark_alarm(master, &e.to_string());
                }
            }
            bitmap.clear(copy_off);
        }
    }

    // -- bitmap normalization ----------------------------------------------

    /// Collapses every fully-set subtree of `bitmap` to its single
    /// ancestor bit (projected-schema structure), reducing delivery size.
    ///
    /// Compression stops below the projected root: bit 0 means "whole
    /// tree" only for a full snapshot, so a delta covering every leaf
    /// still reports the root's children rather than synthesizing bit 0.
    pub fn compress_bitmap(&self, bitmap: &mut ChangeBitmap) {
        let root = self.copy_schema.field(0);
        if bitmap.get(0) {
            for d in 1..root.field_count {
                bitmap.clear(d);
            }
            return;
        }
        for &c in &root.children {
            compress_rec(&self.copy_schema, bitmap, c);
        }
    }

    /// Expands interior bits so that only leaf bits remain set — the
    /// actionable form for [`Projection::update_master`].
    fn expand_to_leaves(&self, bitmap: &mut ChangeBitmap) {
        expand_rec(&self.copy_schema, bitmap, 0, false);
    }

    /// Expands interior bits downward for a read pass: a set interior bit
    /// additionally sets every descendant bit (the interior bit stays).
    fn expand_for_read(&self, bitmap: &mut ChangeBitmap) {
        for off in 0..self.copy_schema.field_count() {
            if bitmap.get(off) && !self.copy_schema.is_leaf(off) {
                for d in self.copy_schema.field(off).range() {
                    bitmap.set(d);
                }
            }
        }
    }

    // -- internals ---------------------------------------------------------

    fn run_filters_to_copy(
        &mut self,
        idx: usize,
        copy: &mut TreeInstance,
        master: &TreeInstance,
        bitmap: &mut ChangeBitmap,
    ) -> bool {
        let fnode = self.nodes[idx].filter_node();
        let filters = &mut self.nodes[idx].filters;
        let mut handled = false;
        for f in filters.iter_mut() {
            if f.to_copy(fnode, copy, master, bitmap) {
                handled = true;
            }
        }
        handled
    }

    /// Returns the arena index of the leaf node whose projected range
    /// contains `copy_off`.
    fn leaf_node_for(&self, copy_off: usize) -> Option<usize> {
        let mut idx = 0;
        loop {
            let node = &self.nodes[idx];
            if !node.copy_range().contains(&copy_off) {
                return None;
            }
            if node.is_leaf() {
                return Some(idx);
            }
            if copy_off == node.copy_offset {
                // the interior field itself has no master leaf
                return None;
            }
            idx = *node
                .children
                .iter()
                .find(|&&c| self.nodes[c].copy_range().contains(&copy_off))?;
        }
    }

    /// Verifies that every interior node's children exactly tile its
    /// projected range. Runs once at compile; later code relies on it.
    fn assert_tiling(&self) {
        for node in &self.nodes {
            if node.is_leaf() {
                continue;
            }
            let mut next = node.copy_offset + 1;
            for &c in &node.children {
                let child = &self.nodes[c];
                assert_eq!(
                    child.copy_offset, next,
                    "projection children must tile their parent range"
                );
                next += child.copy_count;
            }
            assert_eq!(
                next,
                node.copy_offset + node.copy_count,
                "projection children must cover their parent range"
            );
        }
    }

    fn build_ignore_mask(&mut self) {
        let mut mask = ChangeBitmap::new(self.copy_schema.field_count());
        for node in &self.nodes {
            if node.options.ignore {
                for off in node.copy_range() {
                    mask.set(off);
                }
            }
        }
        self.ignore_mask = mask;
    }
}

impl std::fmt::Debug for Projection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projection")
            .field("nodes", &self.nodes.len())
            .field("projected_fields", &self.copy_schema.field_count())
            .finish_non_exhaustive()
    }
}

fn compress_rec(schema: &Schema, bitmap: &mut ChangeBitmap, off: usize) -> bool {
    let field = schema.field(off);
    if field.ty.is_leaf() {
        return bitmap.get(off);
    }
    if bitmap.get(off) {
        // already the whole-subtree bit: descendants are redundant
        for d in off + 1..off + field.field_count {
            bitmap.clear(d);
        }
        return true;
    }
    let mut all = !field.children.is_empty();
    // no short-circuit: every child subtree must get its own chance to
    // compress even when a sibling is incomplete
    for &c in &field.children.clone() {
        if !compress_rec(schema, bitmap, c) {
            all = false;
        }
    }
    if all {
        bitmap.set(off);
        for d in off + 1..off + field.field_count {
            bitmap.clear(d);
        }
    }
    all
}

fn expand_rec(schema: &Schema, bitmap: &mut ChangeBitmap, off: usize, force: bool) {
    let field = schema.field(off);
    if field.ty.is_leaf() {
        if force {
            bitmap.set(off);
        }
        return;
    }
    let force = if bitmap.get(off) {
        bitmap.clear(off);
        true
    } else {
        force
    };
    for &c in &field.children {
        expand_rec(schema, bitmap, c, force);
    }
}

/// Sets the conventional alarm fields of `master` when a per-field copy
/// fails at runtime.
fn mark_alarm(master: &mut TreeInstance, message: &str) {
    use crate::tree::Scalar;
    let sev = master.schema().lookup("alarm.severity");
    let msg = master.schema().lookup("alarm.message");
    if let Some(sev) = sev {
        let _ = master.set(sev, Value::Scalar(Scalar::Int(3)));
    }
    if let Some(msg) = msg {
        let _ = master.set(msg, Value::Scalar(Scalar::Str(message.to_string())));
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

struct Compiler<'a> {
    master_schema: &'a Schema,
    snapshot: &'a TreeInstance,
    registry: &'a FilterRegistry,
    fields: Vec<FieldDef>,
    nodes: Vec<CopyNode>,
    /// Stack of projected structure offsets currently being populated;
    /// empty means the projected root.
    parents: Vec<usize>,
}

impl Compiler<'_> {
    /// Appends a projected field with a provisional `field_count` of 1.
    fn push_field(&mut self, name: String, ty: FieldType, parent: Option<usize>) -> usize {
        let offset = self.fields.len();
        self.fields.push(FieldDef {
            name,
            ty,
            offset,
            field_count: 1,
            parent,
            children: Vec::new(),
        });
        if let Some(p) = parent {
            self.fields[p].children.push(offset);
        }
        offset
    }

    /// Clones the master subtree rooted at `master_off` into the projected
    /// schema under `parent`, reassigning offsets. Returns the clone's
    /// root offset.
    fn clone_subtree(&mut self, master_off: usize, parent: Option<usize>) -> usize {
        let source = self.master_schema.field(master_off).clone();
        let offset = self.push_field(source.name, source.ty, parent);
        for child in source.children {
            self.clone_subtree(child, Some(offset));
        }
        self.fields[offset].field_count = self.fields.len() - offset;
        offset
    }

    /// Resolves every requested child of the master field at `master_off`
    /// into projected fields and copy nodes, appending node indices to
    /// `out_children`.
    fn add_requested(
        &mut self,
        requested: &indexmap::IndexMap<String, RequestNode>,
        master_off: usize,
        path_prefix: &str,
        out_children: &mut Vec<usize>,
    ) -> Result<(), CompileError> {
        for (name, child_req) in requested {
            let path = join_path(path_prefix, name);
            let Some(m_child) = self.master_schema.child_by_name(master_off, name) else {
                return Err(CompileError::FieldNotFound { path });
            };
            let node_idx = self.compile_field(m_child, child_req, &path)?;
            out_children.push(node_idx);
        }
        Ok(())
    }

    /// Compiles one requested field (and its sub-requests) into the arena.
    fn compile_field(
        &mut self,
        master_off: usize,
        req: &RequestNode,
        path: &str,
    ) -> Result<usize, CompileError> {
        let (options, rest) = PvOptions::parse(&req.options)?;
        let m_field = self.master_schema.field(master_off).clone();
        let copy_parent = self.current_parent();

        if req.children.is_empty() {
            // leaf selection: mirror the master field's whole subtree
            let copy_off = self.clone_subtree(master_off, copy_parent);
            let filters = make_filters(&options, &rest, self.registry, &m_field, path);
            let node_idx = self.nodes.len();
            self.nodes.push(CopyNode {
                master_offset: master_off,
                master_count: m_field.field_count,
                copy_offset: copy_off,
                copy_count: m_field.field_count,
                children: Vec::new(),
                options,
                filters,
            });
            return Ok(node_idx);
        }

        match m_field.ty {
            FieldType::Structure => {
                let copy_off =
                    self.push_field(m_field.name.clone(), FieldType::Structure, copy_parent);
                let node_idx = self.nodes.len();
                self.nodes.push(CopyNode {
                    master_offset: master_off,
                    master_count: m_field.field_count,
                    copy_offset: copy_off,
                    copy_count: 1, // patched below
                    children: Vec::new(),
                    options,
                    filters: SmallVec::new(),
                });
                let mut children = Vec::new();
                self.parents.push(copy_off);
                let result = self.add_requested(&req.children, master_off, path, &mut children);
                self.parents.pop();
                result?;
                self.nodes[node_idx].children = children;
                self.nodes[node_idx].copy_count = self.fields.len() - copy_off;
                self.fields[copy_off].field_count = self.fields.len() - copy_off;
                Ok(node_idx)
            }
            FieldType::Union => {
                if req.children.len() != 1 {
                    return Err(CompileError::UnionAmbiguous {
                        path: path.to_string(),
                    });
                }
                let (alt_name, alt_req) = req.children.first().expect("len checked");
                let selected_idx = self.snapshot.selected(master_off).unwrap_or(0);
                let selected_off = m_field.children[selected_idx];
                let selected_name = self.master_schema.field(selected_off).name.clone();
                if *alt_name != selected_name {
                    return Err(CompileError::UnionMismatch {
                        path: path.to_string(),
                        requested: alt_name.clone(),
                        selected: selected_name,
                    });
                }
                // projected form: a structure named like the union holding
                // the selected alternative's subtree
                let copy_off =
                    self.push_field(m_field.name.clone(), FieldType::Structure, copy_parent);
                let node_idx = self.nodes.len();
                self.nodes.push(CopyNode {
                    master_offset: master_off,
                    master_count: m_field.field_count,
                    copy_offset: copy_off,
                    copy_count: 1, // patched below
                    children: Vec::new(),
                    options,
                    filters: SmallVec::new(),
                });
                let alt_path = join_path(path, alt_name);
                let (alt_options, alt_rest) = PvOptions::parse(&alt_req.options)?;
                let alt_field = self.master_schema.field(selected_off).clone();
                let alt_copy_off = self.clone_subtree(selected_off, Some(copy_off));
                let filters =
                    make_filters(&alt_options, &alt_rest, self.registry, &alt_field, &alt_path);
                let leaf_idx = self.nodes.len();
                self.nodes.push(CopyNode {
                    master_offset: selected_off,
                    master_count: alt_field.field_count,
                    copy_offset: alt_copy_off,
                    copy_count: alt_field.field_count,
                    children: Vec::new(),
                    options: alt_options,
                    filters,
                });
                self.nodes[node_idx].children = vec![leaf_idx];
                self.nodes[node_idx].copy_count = self.fields.len() - copy_off;
                self.fields[copy_off].field_count = self.fields.len() - copy_off;
                Ok(node_idx)
            }
            FieldType::Scalar(_) | FieldType::Array(_) => Err(CompileError::NotAStructure {
                path: path.to_string(),
            }),
        }
    }

    fn current_parent(&self) -> Option<usize> {
        self.parents.last().copied().or(Some(0))
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Instantiates the filters implied by a node's options.
fn make_filters(
    options: &PvOptions,
    rest: &indexmap::IndexMap<String, String>,
    registry: &FilterRegistry,
    master_field: &FieldDef,
    path: &str,
) -> SmallVec<[FieldFilter; 2]> {
    let mut filters = SmallVec::new();
    if let Some(deadband) = options.deadband {
        let numeric = matches!(
            master_field.ty,
            FieldType::Scalar(ScalarType::Int | ScalarType::Float)
        );
        if numeric {
            filters.push(FieldFilter::deadband(deadband));
        } else {
            warn!(path, "deadband on a non-numeric field is ignored");
        }
    }
    if options.timestamp.is_some() {
        filters.push(FieldFilter::TimestampOverride);
    }
    if let Some(range) = options.array {
        if matches!(master_field.ty, FieldType::Array(_)) {
            filters.push(FieldFilter::ArraySlice(range));
        } else {
            warn!(path, "array option on a non-array field is ignored");
        }
    }
    for (name, value) in rest {
        if let Some(custom) = registry.create(name, value) {
            filters.push(FieldFilter::Custom(custom));
        } else {
            debug!(path, option = %name, "unrecognized option without a registered filter");
        }
    }
    filters
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Scalar, SchemaBuilder, TreeInstance};

    /// root=0, value=1, alarm=2 (sev=3, status=4, msg=5), timeStamp=6
    /// (secs=7, ns=8), waveform=9, u=10 (asInt=11, asFloat=12)
    fn example_master() -> TreeInstance {
        let schema = SchemaBuilder::new("exampleRecord")
            .scalar("value", ScalarType::Float)
            .alarm()
            .time_stamp()
            .array("waveform", ScalarType::Float)
            .union("u", |b| {
                b.scalar("asInt", ScalarType::Int)
                    .scalar("asFloat", ScalarType::Float)
            })
            .build();
        TreeInstance::new(schema)
    }

    fn compile(master: &TreeInstance, req: &str) -> Result<Projection, CompileError> {
        let spec = RequestSpec::parse(req).unwrap();
        Projection::compile(master, &spec, &FilterRegistry::new())
    }

    fn float(v: f64) -> Value {
        Value::Scalar(Scalar::Float(v))
    }

    fn int(v: i64) -> Value {
        Value::Scalar(Scalar::Int(v))
    }

    // -- compile tests --

    #[test]
    fn test_compile_identity_shares_schema() {
        let master = example_master();
        let p = compile(&master, "").unwrap();
        assert!(Arc::ptr_eq(p.copy_schema(), master.schema()));
        for off in 0..master.schema().field_count() {
            assert_eq!(p.copy_offset(off), Some(off));
            assert_eq!(p.master_offset(off), Some(off));
        }
    }

    #[test]
    fn test_compile_selected_fields() {
        let master = example_master();
        let p = compile(&master, "value,timeStamp").unwrap();
        // copy: root=0, value=1, timeStamp=2 (secs=3, ns=4)
        assert_eq!(p.copy_schema().field_count(), 5);
        assert_eq!(p.copy_schema().lookup("value"), Some(1));
        assert_eq!(p.copy_schema().lookup("timeStamp.secondsPastEpoch"), Some(3));
        assert_eq!(p.copy_offset(1), Some(1));
        assert_eq!(p.copy_offset(6), Some(2));
        assert_eq!(p.copy_offset(8), Some(4));
        // alarm was not requested
        assert_eq!(p.copy_offset(3), None);
    }

    #[test]
    fn test_compile_nested_selection() {
        let master = example_master();
        let p = compile(&master, "alarm{severity,message}").unwrap();
        // copy: root=0, alarm=1, severity=2, message=3
        assert_eq!(p.copy_schema().field_count(), 4);
        assert_eq!(p.copy_offset(2), Some(1));
        assert_eq!(p.copy_offset(3), Some(2));
        assert_eq!(p.copy_offset(5), Some(3));
        // status was dropped
        assert_eq!(p.copy_offset(4), None);
        assert_eq!(p.master_offset(3), Some(5));
    }

    #[test]
    fn test_compile_offset_bijection() {
        let master = example_master();
        let p = compile(&master, "value,alarm{severity},waveform").unwrap();
        for copy_off in 0..p.copy_schema().field_count() {
            let m = p.master_offset(copy_off).unwrap();
            assert_eq!(p.copy_offset(m), Some(copy_off));
        }
    }

    #[test]
    fn test_compile_field_not_found() {
        let master = example_master();
        let err = compile(&master, "nope").unwrap_err();
        assert_eq!(
            err,
            CompileError::FieldNotFound {
                path: "nope".into()
            }
        );
        let err = compile(&master, "alarm.bogus").unwrap_err();
        assert_eq!(
            err,
            CompileError::FieldNotFound {
                path: "alarm.bogus".into()
            }
        );
    }

    #[test]
    fn test_compile_leaf_with_subfields_rejected() {
        let master = example_master();
        let err = compile(&master, "value.sub").unwrap_err();
        assert!(matches!(err, CompileError::NotAStructure { .. }));
    }

    #[test]
    fn test_compile_bad_option() {
        let master = example_master();
        let err = compile(&master, "value[deadband=bogus]").unwrap_err();
        assert!(matches!(err, CompileError::BadOption(_)));
    }

    #[test]
    fn test_compile_root_options() {
        let master = example_master();
        let p = compile(&master, "_options{queueSize=4},value").unwrap();
        assert_eq!(p.root_options().queue_size, Some(4));
    }

    // -- union tests --

    #[test]
    fn test_compile_union_selected_alternative() {
        let master = example_master();
        let p = compile(&master, "u.asInt").unwrap();
        // copy: root=0, u=1 (as structure), asInt=2
        assert_eq!(p.copy_schema().field_count(), 3);
        assert_eq!(p.copy_schema().lookup("u.asInt"), Some(2));
        assert_eq!(p.copy_offset(11), Some(2));
        assert_eq!(p.copy_offset(10), Some(1));
        assert_eq!(p.copy_offset(12), None);
    }

    #[test]
    fn test_compile_union_mismatch() {
        let master = example_master();
        let err = compile(&master, "u.asFloat").unwrap_err();
        assert_eq!(
            err,
            CompileError::UnionMismatch {
                path: "u".into(),
                requested: "asFloat".into(),
                selected: "asInt".into(),
            }
        );
    }

    #[test]
    fn test_compile_union_follows_current_selection() {
        let mut master = example_master();
        master.set(10, Value::Union(1)).unwrap();
        let p = compile(&master, "u.asFloat").unwrap();
        assert_eq!(p.copy_offset(12), Some(2));
    }

    #[test]
    fn test_compile_union_ambiguous() {
        let master = example_master();
        let err = compile(&master, "u{asInt,asFloat}").unwrap_err();
        assert!(matches!(err, CompileError::UnionAmbiguous { .. }));
    }

    // -- synchronization tests --

    #[test]
    fn test_init_copy_transfers_and_sets_all() {
        let mut master = example_master();
        master.set(1, float(3.5)).unwrap();
        master.set(3, int(2)).unwrap();

        let mut p = compile(&master, "value,alarm").unwrap();
        let mut copy = p.new_copy_instance();
        let mut bm = ChangeBitmap::new(p.copy_schema().field_count());
        p.init_copy(&mut copy, &master, &mut bm);

        assert_eq!(copy.get(1), &float(3.5));
        assert_eq!(copy.get(3), &int(2)); // severity landed at copy offset 3
        assert_eq!(bm.count(), p.copy_schema().field_count());
    }

    #[test]
    fn test_update_copy_set_bitset_reports_deltas() {
        let mut master = example_master();
        let mut p = compile(&master, "value,alarm").unwrap();
        let mut copy = p.new_copy_instance();
        let mut bm = ChangeBitmap::new(p.copy_schema().field_count());
        p.init_copy(&mut copy, &master, &mut bm);
        bm.clear_all();

        // nothing changed yet
        assert!(!p.update_copy_set_bitset(&mut copy, &master, &mut bm));

        master.set(1, float(1.25)).unwrap();
        assert!(p.update_copy_set_bitset(&mut copy, &master, &mut bm));
        assert_eq!(bm.ones().collect::<Vec<_>>(), vec![1]);
        assert_eq!(copy.get(1), &float(1.25));

        // second pass with no further change is quiet
        bm.clear_all();
        assert!(!p.update_copy_set_bitset(&mut copy, &master, &mut bm));
    }

    #[test]
    fn test_ignored_field_updates_without_notifying() {
        let mut master = example_master();
        let mut p = compile(&master, "value,timeStamp[ignore=true]").unwrap();
        let mut copy = p.new_copy_instance();
        let mut bm = ChangeBitmap::new(p.copy_schema().field_count());
        p.init_copy(&mut copy, &master, &mut bm);
        bm.clear_all();

        // timeStamp-only change: copied but not reported
        master.set(7, int(1_700_000_000)).unwrap();
        assert!(!p.update_copy_set_bitset(&mut copy, &master, &mut bm));
        assert_eq!(copy.get(3), &int(1_700_000_000));

        // a value change still reports
        master.set(1, float(9.0)).unwrap();
        assert!(p.update_copy_set_bitset(&mut copy, &master, &mut bm));
    }

    #[test]
    fn test_update_copy_from_bitset_copies_requested_subtrees() {
        let mut master = example_master();
        master.set(3, int(1)).unwrap();
        master.set(5, Value::Scalar(Scalar::Str("HIGH".into()))).unwrap();

        let mut p = compile(&master, "value,alarm").unwrap();
        let mut copy = p.new_copy_instance();
        let mut bm = ChangeBitmap::new(p.copy_schema().field_count());

        // only the alarm subtree bit set: value stays default
        bm.set(2);
        p.update_copy_from_bitset(&mut copy, &master, &mut bm);
        assert_eq!(copy.get(3), &int(1));
        assert_eq!(copy.get(5), &Value::Scalar(Scalar::Str("HIGH".into())));
        assert_eq!(copy.get(1), &float(0.0));
        // the descendant set was materialized in the bitmap
        assert!(bm.all_set_in(2..6));
    }

    #[test]
    fn test_update_copy_from_bitset_bit_zero_means_everything() {
        let mut master = example_master();
        master.set(1, float(4.0)).unwrap();
        let mut p = compile(&master, "value,alarm").unwrap();
        let mut copy = p.new_copy_instance();
        let mut bm = ChangeBitmap::new(p.copy_schema().field_count());

        bm.set(0);
        p.update_copy_from_bitset(&mut copy, &master, &mut bm);
        assert_eq!(copy.get(1), &float(4.0));
        assert_eq!(bm.count(), p.copy_schema().field_count());
    }

    #[test]
    fn test_update_master_applies_and_clears() {
        let master_inst = example_master();
        let mut p = compile(&master_inst, "value,alarm").unwrap();
        let mut master = master_inst;
        let mut copy = p.new_copy_instance();
        let mut bm = ChangeBitmap::new(p.copy_schema().field_count());

        copy.set(1, float(7.25)).unwrap();
        bm.set(1);
        p.update_master(&copy, &mut master, &mut bm);
        assert_eq!(master.get(1), &float(7.25));
        assert!(!bm.any());
    }

    #[test]
    fn test_update_master_expands_interior_bits() {
        let master_inst = example_master();
        let mut p = compile(&master_inst, "value,alarm").unwrap();
        let mut master = master_inst;
        let mut copy = p.new_copy_instance();
        let mut bm = ChangeBitmap::new(p.copy_schema().field_count());

        copy.set(3, int(2)).unwrap();
        copy.set(5, Value::Scalar(Scalar::Str("LOLO".into()))).unwrap();
        bm.set(2); // whole-alarm bit
        p.update_master(&copy, &mut master, &mut bm);
        assert_eq!(master.get(3), &int(2));
        assert_eq!(master.get(5), &Value::Scalar(Scalar::Str("LOLO".into())));
        assert!(!bm.any());
    }

    #[test]
    fn test_update_master_bad_value_marks_alarm() {
        let master_inst = example_master();
        let mut p = compile(&master_inst, "value,alarm").unwrap();
        let mut master = master_inst;
        // same shape as the projected copy, but `value` is a string field
        let bad_schema = SchemaBuilder::new("impostor")
            .scalar("value", ScalarType::Str)
            .alarm()
            .build();
        let mut copy = TreeInstance::new(bad_schema);
        copy.set(1, Value::Scalar(Scalar::Str("oops".into()))).unwrap();
        let mut bm = ChangeBitmap::new(p.copy_schema().field_count());

        bm.set(1);
        p.update_master(&copy, &mut master, &mut bm);
        // the put is rejected, the alarm is raised, and the pass finishes
        assert_eq!(master.get(1), &float(0.0));
        assert_eq!(master.get(3), &int(3));
        assert!(matches!(master.get(5), Value::Scalar(Scalar::Str(m)) if !m.is_empty()));
        assert!(!bm.any());
    }

    // -- filter integration tests --

    #[test]
    fn test_deadband_option_suppresses_small_changes() {
        let mut master = example_master();
        let mut p = compile(&master, "value[deadband=abs:1.0]").unwrap();
        let mut copy = p.new_copy_instance();
        let mut bm = ChangeBitmap::new(p.copy_schema().field_count());
        p.init_copy(&mut copy, &master, &mut bm);
        bm.clear_all();

        master.set(1, float(0.5)).unwrap();
        assert!(!p.update_copy_set_bitset(&mut copy, &master, &mut bm));
        assert_eq!(copy.get(1), &float(0.0)); // not copied either

        master.set(1, float(2.0)).unwrap();
        assert!(p.update_copy_set_bitset(&mut copy, &master, &mut bm));
        assert_eq!(copy.get(1), &float(2.0));
    }

    #[test]
    fn test_array_option_copies_strided_slice() {
        let mut master = example_master();
        master
            .set(9, Value::Array((0..6).map(|i| Scalar::Float(f64::from(i))).collect()))
            .unwrap();
        let mut p = compile(&master, "waveform[array=1:2]").unwrap();
        let mut copy = p.new_copy_instance();
        let mut bm = ChangeBitmap::new(p.copy_schema().field_count());
        p.init_copy(&mut copy, &master, &mut bm);

        assert_eq!(
            copy.get(1),
            &Value::Array(vec![
                Scalar::Float(1.0),
                Scalar::Float(3.0),
                Scalar::Float(5.0)
            ])
        );
    }

    #[test]
    fn test_deadband_on_non_numeric_field_is_dropped() {
        let master = example_master();
        // alarm.message is a string: the filter is skipped, compile succeeds
        let p = compile(&master, "alarm{message[deadband=abs:1.0]}").unwrap();
        assert_eq!(p.copy_schema().field_count(), 3);
    }

    // -- bitmap normalization tests --

    #[test]
    fn test_compress_bitmap_collapses_full_subtrees() {
        let master = example_master();
        let p = compile(&master, "value,alarm").unwrap();
        let mut bm = ChangeBitmap::new(p.copy_schema().field_count());
        bm.set(3);
        bm.set(4);
        bm.set(5);
        p.compress_bitmap(&mut bm);
        assert_eq!(bm.ones().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_compress_bitmap_full_delta_stops_below_root() {
        let master = example_master();
        let p = compile(&master, "value,alarm").unwrap();
        let mut bm = ChangeBitmap::new(p.copy_schema().field_count());
        for off in 1..p.copy_schema().field_count() {
            if p.copy_schema().is_leaf(off) {
                bm.set(off);
            }
        }
        // even a delta touching every leaf never becomes bit 0; that bit
        // is reserved for the initial full snapshot
        p.compress_bitmap(&mut bm);
        assert_eq!(bm.ones().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_compress_bitmap_single_field_delta_keeps_leaf_bit() {
        let master = example_master();
        let p = compile(&master, "value").unwrap();
        let mut bm = ChangeBitmap::new(p.copy_schema().field_count());
        bm.set(1);
        p.compress_bitmap(&mut bm);
        assert_eq!(bm.ones().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_compress_bitmap_snapshot_bit_clears_descendants() {
        let master = example_master();
        let p = compile(&master, "value,alarm").unwrap();
        let mut bm = ChangeBitmap::new(p.copy_schema().field_count());
        bm.set(0);
        bm.set(3);
        p.compress_bitmap(&mut bm);
        assert_eq!(bm.ones().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_compress_bitmap_partial_subtree_untouched() {
        let master = example_master();
        let p = compile(&master, "value,alarm").unwrap();
        let mut bm = ChangeBitmap::new(p.copy_schema().field_count());
        bm.set(3);
        bm.set(5);
        p.compress_bitmap(&mut bm);
        assert_eq!(bm.ones().collect::<Vec<_>>(), vec![3, 5]);
    }

    #[test]
    fn test_compress_then_decompress_round_trips() {
        let master = example_master();
        let mut p = compile(&master, "value,alarm").unwrap();
        let mut copy = p.new_copy_instance();
        let mut bm = ChangeBitmap::new(p.copy_schema().field_count());
        bm.set(3);
        bm.set(4);
        bm.set(5);
        p.compress_bitmap(&mut bm);
        assert_eq!(bm.ones().collect::<Vec<_>>(), vec![2]);
        p.update_copy_from_bitset(&mut copy, &master, &mut bm);
        assert!(bm.all_set_in(2..6));
        assert!(!bm.get(1));
    }
}
