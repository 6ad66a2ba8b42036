//! Arena-based file system trees.
//!
//! Nodes are stored in a map indexed by id, each carrying its parent id and
//! a sorted child-id set; parent and child lookups are O(1) without shared
//! mutable references. All mutation goes through [`Tree::execute`], which
//! validates structural invariants and returns the list of affected nodes,
//! so callers can mirror changes without re-entrant observer callbacks.
//!
//! [`AltTree`] wraps a tree whose models also carry the opposite replica's
//! id and maintains the alt-id index (Synced and Propagation trees).

mod node;
mod traversal;

pub use node::{
    AltIdentifiable, PropagationNodeModel, SyncedNodeModel, TreeModel, UpdateNodeModel,
};
pub use traversal::{post_order_ids, pre_order_ids};

use std::collections::{BTreeSet, HashMap};
use std::ops::Deref;

use crate::errors::TreeError;
use crate::models::{names_eq, NodeKey, NodeType, Operation, OperationType, Replica};
use crate::store::{MemoryTreeStore, TreeStore};

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// One applied tree change: the node model before and after.
#[derive(Debug, Clone)]
pub struct TreeMutation<M> {
    pub op_type: OperationType,
    pub old: Option<M>,
    pub new: Option<M>,
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

/// The tree of named identifiable file system nodes.
pub struct Tree<Id: NodeKey, M: TreeModel<Id>> {
    name: String,
    root_id: Id,
    nodes: HashMap<Id, M>,
    children: HashMap<Id, BTreeSet<Id>>,
    store: Box<dyn TreeStore<Id, M>>,
}

impl<Id: NodeKey, M: TreeModel<Id>> Tree<Id, M> {
    /// Open a tree over the given store. If the store is empty the root
    /// model is persisted; otherwise the persisted nodes are loaded and the
    /// arena rebuilt around the same root id.
    pub fn open(
        name: impl Into<String>,
        root_model: M,
        store: Box<dyn TreeStore<Id, M>>,
    ) -> Result<Self, TreeError> {
        let name = name.into();
        let root_id = root_model.id();

        let mut tree = Self {
            name,
            root_id,
            nodes: HashMap::new(),
            children: HashMap::new(),
            store,
        };

        let persisted = tree.store.load_all()?;
        if persisted.is_empty() {
            tree.store.insert(root_id, &root_model)?;
            tree.attach(root_model);
        } else {
            for model in persisted {
                tree.attach(model);
            }
            if !tree.nodes.contains_key(&root_id) {
                return Err(TreeError::NodeNotFound(root_id.to_string()));
            }
        }

        Ok(tree)
    }

    /// An ephemeral tree with no durability.
    pub fn in_memory(name: impl Into<String>, root_model: M) -> Self {
        Self::open(name, root_model, Box::new(MemoryTreeStore::new()))
            .expect("in-memory store cannot fail")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_id(&self) -> Id {
        self.root_id
    }

    pub fn root(&self) -> &M {
        &self.nodes[&self.root_id]
    }

    pub fn is_root(&self, id: Id) -> bool {
        id == self.root_id
    }

    pub fn contains(&self, id: Id) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node(&self, id: Id) -> Option<&M> {
        self.nodes.get(&id)
    }

    /// Node lookup that treats absence as an invariant violation.
    pub fn get(&self, id: Id) -> Result<&M, TreeError> {
        self.node(id)
            .ok_or_else(|| TreeError::NodeNotFound(id.to_string()))
    }

    /// Number of nodes excluding the root.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Whether the tree holds nothing but the root.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_leaf(&self, id: Id) -> bool {
        self.children.get(&id).map_or(true, BTreeSet::is_empty)
    }

    pub fn children_ids(&self, id: Id) -> impl Iterator<Item = Id> + '_ {
        self.children.get(&id).into_iter().flatten().copied()
    }

    pub fn child_models(&self, id: Id) -> impl Iterator<Item = &M> + '_ {
        self.children_ids(id).filter_map(move |child| self.node(child))
    }

    /// Children of `parent_id` whose name equals `name` (case-insensitive).
    pub fn children_by_name<'a>(
        &'a self,
        parent_id: Id,
        name: &'a str,
    ) -> impl Iterator<Item = &'a M> + 'a {
        self.child_models(parent_id)
            .filter(move |child| names_eq(child.name(), name))
    }

    /// Ids of the node's ancestors, nearest first, ending at the root.
    pub fn ancestor_ids(&self, id: Id) -> Vec<Id> {
        let mut ancestors = Vec::new();
        let mut current = id;

        while let Some(model) = self.node(current) {
            if current == self.root_id {
                break;
            }

            let parent = model.parent_id();
            ancestors.push(parent);
            current = parent;
        }

        ancestors
    }

    /// Apply one operation, returning the affected nodes.
    pub fn execute(&mut self, operation: Operation<M>) -> Result<Vec<TreeMutation<M>>, TreeError> {
        let id = operation.model.id();

        match operation.op_type {
            OperationType::Create => {
                let model = operation.model;

                if self.contains(id) {
                    return Err(TreeError::NodeAlreadyExists(id.to_string()));
                }

                self.check_parent(id, model.parent_id())?;
                self.store.insert(id, &model)?;
                self.attach(model.clone());

                Ok(vec![TreeMutation {
                    op_type: OperationType::Create,
                    old: None,
                    new: Some(model),
                }])
            }

            OperationType::Update => {
                // The root node is allowed to be updated.
                let old = self.get(id)?.clone();

                let mut new = old.clone();
                new.copy_metadata_from(&operation.model);

                self.store.update(id, &new)?;
                self.nodes.insert(id, new.clone());

                Ok(vec![TreeMutation {
                    op_type: OperationType::Update,
                    old: Some(old),
                    new: Some(new),
                }])
            }

            OperationType::Edit => {
                let old = self.get(id)?.clone();
                if self.is_root(id) {
                    return Err(TreeError::RootMutation);
                }

                let mut new = old.clone();
                new.fs_mut().copy_attributes_from(operation.model.fs());
                new.copy_metadata_from(&operation.model);

                self.store.update(id, &new)?;
                self.nodes.insert(id, new.clone());

                Ok(vec![TreeMutation {
                    op_type: OperationType::Edit,
                    old: Some(old),
                    new: Some(new),
                }])
            }

            OperationType::Move => {
                let old = self.get(id)?.clone();
                if self.is_root(id) {
                    return Err(TreeError::RootMutation);
                }

                let new_parent = operation.model.parent_id();
                self.check_parent(id, new_parent)?;
                self.check_for_cycle(id, new_parent)?;

                let mut new = old.clone();
                new.fs_mut().copy_link_from(operation.model.fs());
                new.copy_metadata_from(&operation.model);

                self.store.update(id, &new)?;

                if old.parent_id() != new_parent {
                    if let Some(siblings) = self.children.get_mut(&old.parent_id()) {
                        siblings.remove(&id);
                    }
                    self.children.entry(new_parent).or_default().insert(id);
                }

                self.nodes.insert(id, new.clone());

                Ok(vec![TreeMutation {
                    op_type: OperationType::Move,
                    old: Some(old),
                    new: Some(new),
                }])
            }

            OperationType::Delete => {
                if self.is_root(id) {
                    return Err(TreeError::RootMutation);
                }
                self.get(id)?;

                // Children strictly before parents, the node itself last.
                let doomed = post_order_ids(self, id, true);
                let mut mutations = Vec::with_capacity(doomed.len());

                for victim in doomed {
                    let model = self
                        .nodes
                        .remove(&victim)
                        .ok_or_else(|| TreeError::NodeNotFound(victim.to_string()))?;

                    self.store.delete(victim)?;
                    self.children.remove(&victim);
                    if let Some(siblings) = self.children.get_mut(&model.parent_id()) {
                        siblings.remove(&victim);
                    }

                    mutations.push(TreeMutation {
                        op_type: OperationType::Delete,
                        old: Some(model),
                        new: None,
                    });
                }

                Ok(mutations)
            }
        }
    }

    /// Delete every child subtree of `id`, children strictly before
    /// parents.
    pub fn delete_children(&mut self, id: Id) -> Result<Vec<TreeMutation<M>>, TreeError> {
        let children: Vec<Id> = self.children_ids(id).collect();
        let mut mutations = Vec::new();

        for child in children {
            if let Some(model) = self.node(child).cloned() {
                mutations.extend(self.execute(Operation::delete(model))?);
            }
        }

        Ok(mutations)
    }

    /// Apply a sequence of operations, collecting all affected nodes.
    pub fn execute_all(
        &mut self,
        operations: impl IntoIterator<Item = Operation<M>>,
    ) -> Result<Vec<TreeMutation<M>>, TreeError> {
        let mut mutations = Vec::new();
        for operation in operations {
            mutations.extend(self.execute(operation)?);
        }
        Ok(mutations)
    }

    /// Remove everything except the root.
    pub fn clear(&mut self) -> Result<(), TreeError> {
        let root = self.root().clone();

        self.store.clear()?;
        self.store.insert(self.root_id, &root)?;

        self.nodes.clear();
        self.children.clear();
        self.attach(root);

        Ok(())
    }

    /// Starting from `start`, delete the node while it is a prunable leaf,
    /// then continue with its parent; each removal may unblock the next.
    pub fn prune_upward(
        &mut self,
        start: Option<Id>,
        prunable: impl Fn(&M) -> bool,
    ) -> Result<Vec<TreeMutation<M>>, TreeError> {
        let mut mutations = Vec::new();

        let Some(mut current) = start else {
            return Ok(mutations);
        };

        loop {
            if self.is_root(current) {
                break;
            }

            let Some(model) = self.node(current) else {
                break;
            };

            if !self.is_leaf(current) || !prunable(model) {
                break;
            }

            let parent = model.parent_id();
            mutations.extend(self.execute(Operation::delete(model.clone()))?);
            current = parent;
        }

        Ok(mutations)
    }

    fn attach(&mut self, model: M) {
        let id = model.id();
        let parent_id = model.parent_id();

        if id != self.root_id {
            self.children.entry(parent_id).or_default().insert(id);
        }
        self.children.entry(id).or_default();
        self.nodes.insert(id, model);
    }

    fn check_parent(&self, id: Id, parent_id: Id) -> Result<(), TreeError> {
        if parent_id == id {
            return Err(TreeError::CyclicMove {
                id: id.to_string(),
                parent_id: parent_id.to_string(),
            });
        }

        let parent = self.node(parent_id).ok_or_else(|| TreeError::MissingParent {
            id: id.to_string(),
            parent_id: parent_id.to_string(),
        })?;

        if parent.node_type() != NodeType::Directory {
            return Err(TreeError::ParentNotDirectory(parent_id.to_string()));
        }

        Ok(())
    }

    fn check_for_cycle(&self, id: Id, new_parent: Id) -> Result<(), TreeError> {
        // Moving a node into its own subtree would detach it from the root.
        let mut current = new_parent;

        while !self.is_root(current) {
            if current == id {
                return Err(TreeError::CyclicMove {
                    id: id.to_string(),
                    parent_id: new_parent.to_string(),
                });
            }

            match self.node(current) {
                Some(model) => current = model.parent_id(),
                None => break,
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Alt-id indexed tree
// ---------------------------------------------------------------------------

/// A tree whose nodes are additionally indexed by the opposite replica's
/// id. Mutations must go through [`AltTree::execute`] so the index stays
/// consistent; read access derefs to [`Tree`].
pub struct AltTree<Id: NodeKey, M: TreeModel<Id> + AltIdentifiable<Id>> {
    tree: Tree<Id, M>,
    alt_index: HashMap<Id, Id>,
}

impl<Id: NodeKey, M: TreeModel<Id> + AltIdentifiable<Id>> AltTree<Id, M> {
    pub fn open(
        name: impl Into<String>,
        root_model: M,
        store: Box<dyn TreeStore<Id, M>>,
    ) -> Result<Self, TreeError> {
        let tree = Tree::open(name, root_model, store)?;

        let mut alt_index = HashMap::new();
        for model in tree.nodes.values() {
            alt_index.insert(model.alt_id(), model.id());
        }

        Ok(Self { tree, alt_index })
    }

    pub fn in_memory(name: impl Into<String>, root_model: M) -> Self {
        Self::open(name, root_model, Box::new(MemoryTreeStore::new()))
            .expect("in-memory store cannot fail")
    }

    pub fn node_by_alt_id(&self, alt_id: Id) -> Option<&M> {
        self.alt_index
            .get(&alt_id)
            .and_then(|id| self.tree.node(*id))
    }

    pub fn execute(&mut self, operation: Operation<M>) -> Result<Vec<TreeMutation<M>>, TreeError> {
        // A brand-new node claiming an alt id that is already linked is a
        // logic defect. Updates may re-link an alt id (duplicate-node
        // coalescing); the index is last-wins for those.
        if operation.op_type == OperationType::Create {
            let alt = operation.model.alt_id();
            if let Some(existing) = self.alt_index.get(&alt) {
                if *existing != operation.model.id() {
                    return Err(TreeError::DuplicateAltId {
                        alt_id: alt.to_string(),
                        id: existing.to_string(),
                    });
                }
            }
        }

        let mutations = self.tree.execute(operation)?;
        self.index_mutations(&mutations);
        Ok(mutations)
    }

    pub fn execute_all(
        &mut self,
        operations: impl IntoIterator<Item = Operation<M>>,
    ) -> Result<Vec<TreeMutation<M>>, TreeError> {
        let mut mutations = Vec::new();
        for operation in operations {
            mutations.extend(self.execute(operation)?);
        }
        Ok(mutations)
    }

    pub fn clear(&mut self) -> Result<(), TreeError> {
        self.tree.clear()?;

        self.alt_index.clear();
        let root = self.tree.root();
        self.alt_index.insert(root.alt_id(), root.id());

        Ok(())
    }

    pub fn prune_upward(
        &mut self,
        start: Option<Id>,
        prunable: impl Fn(&M) -> bool,
    ) -> Result<Vec<TreeMutation<M>>, TreeError> {
        let mutations = self.tree.prune_upward(start, prunable)?;
        self.index_mutations(&mutations);
        Ok(mutations)
    }

    fn index_mutations(&mut self, mutations: &[TreeMutation<M>]) {
        for mutation in mutations {
            if let Some(old) = &mutation.old {
                if self.alt_index.get(&old.alt_id()) == Some(&old.id()) {
                    self.alt_index.remove(&old.alt_id());
                }
            }
            if let Some(new) = &mutation.new {
                self.alt_index.insert(new.alt_id(), new.id());
            }
        }
    }
}

impl<Id: NodeKey, M: TreeModel<Id> + AltIdentifiable<Id>> Deref for AltTree<Id, M> {
    type Target = Tree<Id, M>;

    fn deref(&self) -> &Self::Target {
        &self.tree
    }
}

// ---------------------------------------------------------------------------
// Typed trees
// ---------------------------------------------------------------------------

pub type SyncedTree<Id> = AltTree<Id, SyncedNodeModel<Id>>;
pub type UpdateTree<Id> = Tree<Id, UpdateNodeModel<Id>>;
pub type PropagationTree<Id> = AltTree<Id, PropagationNodeModel<Id>>;

impl<Id: NodeKey> SyncedTree<Id> {
    /// Lookup by the node's id in the given replica's id space.
    pub fn node_by_own_id(&self, id: Id, replica: Replica) -> Option<&SyncedNodeModel<Id>> {
        match replica {
            Replica::Local => self.node(id),
            Replica::Remote => self.node_by_alt_id(id),
        }
    }
}

/// The four trees the engine reconciles over.
pub struct TreeSet<Id: NodeKey> {
    pub synced: SyncedTree<Id>,
    pub remote_updates: UpdateTree<Id>,
    pub local_updates: UpdateTree<Id>,
    pub propagation: PropagationTree<Id>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FsNodeModel;
    use crate::status::UpdateStatus;

    fn update_tree() -> UpdateTree<u64> {
        UpdateTree::in_memory(
            "updates",
            UpdateNodeModel::new(FsNodeModel::directory(0u64, 0, ""), UpdateStatus::UNCHANGED),
        )
    }

    fn dir(id: u64, parent: u64, name: &str) -> UpdateNodeModel<u64> {
        UpdateNodeModel::new(FsNodeModel::directory(id, parent, name), UpdateStatus::UNCHANGED)
    }

    fn file(id: u64, parent: u64, name: &str) -> UpdateNodeModel<u64> {
        UpdateNodeModel::new(FsNodeModel::file(id, parent, name), UpdateStatus::UNCHANGED)
    }

    #[test]
    fn test_create_and_lookup() {
        let mut tree = update_tree();
        tree.execute(Operation::create(dir(1, 0, "docs"))).unwrap();
        tree.execute(Operation::create(file(2, 1, "a.txt"))).unwrap();

        assert_eq!(tree.len(), 2);
        assert_eq!(tree.node(2).unwrap().name(), "a.txt");
        assert!(tree.is_leaf(2));
        assert!(!tree.is_leaf(1));
        assert_eq!(tree.children_ids(1).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_create_rejects_missing_parent_and_duplicates() {
        let mut tree = update_tree();

        let err = tree.execute(Operation::create(file(2, 9, "a.txt"))).unwrap_err();
        assert!(matches!(err, TreeError::MissingParent { .. }));

        tree.execute(Operation::create(dir(1, 0, "docs"))).unwrap();
        let err = tree.execute(Operation::create(dir(1, 0, "docs"))).unwrap_err();
        assert!(matches!(err, TreeError::NodeAlreadyExists(_)));
    }

    #[test]
    fn test_create_rejects_file_parent() {
        let mut tree = update_tree();
        tree.execute(Operation::create(file(1, 0, "a.txt"))).unwrap();

        let err = tree.execute(Operation::create(file(2, 1, "b.txt"))).unwrap_err();
        assert!(matches!(err, TreeError::ParentNotDirectory(_)));
    }

    #[test]
    fn test_move_updates_child_index() {
        let mut tree = update_tree();
        tree.execute(Operation::create(dir(1, 0, "a"))).unwrap();
        tree.execute(Operation::create(dir(2, 0, "b"))).unwrap();
        tree.execute(Operation::create(file(3, 1, "x.txt"))).unwrap();

        tree.execute(Operation::mv(file(3, 2, "y.txt"))).unwrap();

        assert!(tree.is_leaf(1));
        assert_eq!(tree.children_ids(2).collect::<Vec<_>>(), vec![3]);
        assert_eq!(tree.node(3).unwrap().name(), "y.txt");
    }

    #[test]
    fn test_move_into_own_subtree_is_rejected() {
        let mut tree = update_tree();
        tree.execute(Operation::create(dir(1, 0, "a"))).unwrap();
        tree.execute(Operation::create(dir(2, 1, "b"))).unwrap();

        let err = tree.execute(Operation::mv(dir(1, 2, "a"))).unwrap_err();
        assert!(matches!(err, TreeError::CyclicMove { .. }));
    }

    #[test]
    fn test_delete_removes_subtree_children_first() {
        let mut tree = update_tree();
        tree.execute(Operation::create(dir(1, 0, "a"))).unwrap();
        tree.execute(Operation::create(dir(2, 1, "b"))).unwrap();
        tree.execute(Operation::create(file(3, 2, "x.txt"))).unwrap();

        let mutations = tree.execute(Operation::delete(dir(1, 0, "a"))).unwrap();
        let deleted: Vec<u64> = mutations.iter().map(|m| m.old.as_ref().unwrap().id()).collect();

        assert_eq!(deleted, vec![3, 2, 1]);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_root_mutation_is_rejected() {
        let mut tree = update_tree();
        let err = tree.execute(Operation::delete(dir(0, 0, ""))).unwrap_err();
        assert!(matches!(err, TreeError::RootMutation));

        let err = tree.execute(Operation::mv(dir(0, 1, "r"))).unwrap_err();
        assert!(matches!(err, TreeError::RootMutation));
    }

    #[test]
    fn test_prune_upward_removes_unchanged_leaf_chain() {
        let mut tree = update_tree();
        tree.execute(Operation::create(dir(1, 0, "a"))).unwrap();
        tree.execute(Operation::create(dir(2, 1, "b"))).unwrap();
        tree.execute(Operation::create(
            file(3, 2, "x.txt").with_status(UpdateStatus::EDITED),
        ))
        .unwrap();

        // Nothing prunable while the edited leaf exists.
        tree.prune_upward(Some(2), |m| m.status.is_unchanged()).unwrap();
        assert_eq!(tree.len(), 3);

        tree.execute(Operation::delete(file(3, 2, "x.txt"))).unwrap();
        tree.prune_upward(Some(2), |m| m.status.is_unchanged()).unwrap();
        assert!(tree.is_empty());
    }

    #[test]
    fn test_children_by_name_is_case_insensitive() {
        let mut tree = update_tree();
        tree.execute(Operation::create(dir(1, 0, "docs"))).unwrap();
        tree.execute(Operation::create(file(2, 1, "Readme.md"))).unwrap();

        let hits: Vec<_> = tree.children_by_name(1, "readme.MD").collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id(), 2);
    }

    #[test]
    fn test_alt_tree_index_follows_mutations() {
        let mut tree: SyncedTree<u64> = SyncedTree::in_memory(
            "synced",
            SyncedNodeModel::new(FsNodeModel::directory(0u64, 0, ""), 0),
        );

        tree.execute(Operation::create(SyncedNodeModel::new(
            FsNodeModel::directory(1, 0, "docs"),
            100,
        )))
        .unwrap();

        assert_eq!(tree.node_by_alt_id(100).unwrap().id(), 1);
        assert_eq!(tree.node_by_own_id(100, Replica::Remote).unwrap().id(), 1);
        assert_eq!(tree.node_by_own_id(1, Replica::Local).unwrap().id(), 1);

        tree.execute(Operation::delete(SyncedNodeModel::new(
            FsNodeModel::directory(1, 0, "docs"),
            100,
        )))
        .unwrap();
        assert!(tree.node_by_alt_id(100).is_none());
    }

    #[test]
    fn test_alt_tree_rejects_duplicate_alt_id() {
        let mut tree: SyncedTree<u64> = SyncedTree::in_memory(
            "synced",
            SyncedNodeModel::new(FsNodeModel::directory(0u64, 0, ""), 0),
        );

        tree.execute(Operation::create(SyncedNodeModel::new(
            FsNodeModel::directory(1, 0, "a"),
            100,
        )))
        .unwrap();

        let err = tree
            .execute(Operation::create(SyncedNodeModel::new(
                FsNodeModel::directory(2, 0, "b"),
                100,
            )))
            .unwrap_err();
        assert!(matches!(err, TreeError::DuplicateAltId { .. }));
    }

    #[test]
    fn test_open_reloads_from_store() {
        use crate::store::{Database, SqliteTreeStore};

        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();

        let store: SqliteTreeStore<u64, UpdateNodeModel<u64>> = db.tree_store("updates");
        let mut tree = Tree::open("updates", dir(0, 0, ""), Box::new(store)).unwrap();
        tree.execute(Operation::create(dir(1, 0, "docs"))).unwrap();
        tree.execute(Operation::create(file(2, 1, "a.txt"))).unwrap();
        drop(tree);

        let store: SqliteTreeStore<u64, UpdateNodeModel<u64>> = db.tree_store("updates");
        let reloaded = Tree::open("updates", dir(0, 0, ""), Box::new(store)).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.node(2).unwrap().name(), "a.txt");
        assert_eq!(reloaded.children_ids(1).collect::<Vec<_>>(), vec![2]);
    }
}
