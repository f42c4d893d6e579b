//! Class descriptors.
//!
//! A [`Class`] describes what instances of it can do: which properties hold
//! entity references (and with what ownership), lifecycle hooks, event
//! handlers, observers and, for components, bindings. Classes form a single
//! inheritance chain rooted at [`Class::managed_object`].
//!
//! Handlers and observers may be added after instances exist; they apply to
//! every instance from then on.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use hashbrown::HashMap;

use crate::component::Binding;
use crate::container::ContainerKind;
use crate::entity::Lifecycle;
use crate::link::Ownership;
use crate::model::{ClassId, EntityId, ManagedEvent, ObserverId};
use crate::observe::ObserverSpec;
use crate::{Graph, Result};

/// Handler run for every event an instance emits.
pub type EventHandler = Rc<dyn Fn(&Graph, EntityId, &ManagedEvent) -> Result<()>>;

/// Decides which event, if any, an owner re-emits when one of its
/// property-owned children emits. Receives the owner's id.
pub type ChildRelay = Rc<dyn Fn(&Graph, EntityId, &ManagedEvent) -> Result<Option<ManagedEvent>>>;

struct ClassInfo {
    id: ClassId,
    name: String,
    parent: Option<Class>,
    container: Option<ContainerKind>,
    component: bool,
    hooks: Option<Rc<dyn Lifecycle>>,
    references: HashMap<String, Ownership>,
    bindings: Vec<(String, Binding)>,
    composes: Vec<Class>,
    handlers: RefCell<Vec<EventHandler>>,
    child_relay: RefCell<Option<ChildRelay>>,
    observers: RefCell<Vec<Rc<ObserverSpec>>>,
}

/// Shared class handle; clones refer to the same descriptor.
#[derive(Clone)]
pub struct Class(Rc<ClassInfo>);

struct Builtins {
    object: Class,
    list: Class,
    map: Class,
    reference: Class,
    component: Class,
}

// Built with `ClassBuilder::root`: `ClassBuilder::new` reads `BUILTINS`.
thread_local! {
    static BUILTINS: Builtins = Builtins::new();
}

impl Builtins {
    fn new() -> Self {
        let object = ClassBuilder::root("ManagedObject").build();
        let container = |name: &str, kind| {
            let mut builder = ClassBuilder::root(name).extends(&object);
            builder.container = Some(kind);
            builder.build()
        };
        let list = container("ManagedList", ContainerKind::List);
        let map = container("ManagedMap", ContainerKind::Map);
        let reference = container("ManagedReference", ContainerKind::Reference);
        let mut component = ClassBuilder::root("Component").extends(&object);
        component.component = true;
        let component = component.build();
        Self { object, list, map, reference, component }
    }
}

impl Class {
    /// Root of every class chain.
    pub fn managed_object() -> Class {
        BUILTINS.with(|b| b.object.clone())
    }

    pub fn list() -> Class {
        BUILTINS.with(|b| b.list.clone())
    }

    pub fn map() -> Class {
        BUILTINS.with(|b| b.map.clone())
    }

    pub fn reference() -> Class {
        BUILTINS.with(|b| b.reference.clone())
    }

    /// Base class of components.
    pub fn component() -> Class {
        BUILTINS.with(|b| b.component.clone())
    }

    /// Builder for a subclass of [`Class::managed_object`].
    pub fn builder(name: impl Into<String>) -> ClassBuilder {
        ClassBuilder::new(name)
    }

    pub fn id(&self) -> ClassId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn parent(&self) -> Option<&Class> {
        self.0.parent.as_ref()
    }

    /// This class followed by its ancestors.
    pub fn ancestry(&self) -> impl Iterator<Item = &Class> {
        std::iter::successors(Some(self), |c| c.parent())
    }

    pub fn is_subclass_of(&self, other: &Class) -> bool {
        self.ancestry().any(|c| c.id() == other.id())
    }

    pub fn is_component(&self) -> bool {
        self.0.component
    }

    pub(crate) fn container_kind(&self) -> Option<ContainerKind> {
        self.0.container
    }

    /// Nearest lifecycle hooks along the chain.
    pub fn lifecycle(&self) -> Option<Rc<dyn Lifecycle>> {
        self.ancestry().find_map(|c| c.0.hooks.clone())
    }

    /// Ownership of a declared reference property, if `name` is one.
    pub fn reference_ownership(&self, name: &str) -> Option<Ownership> {
        self.ancestry().find_map(|c| c.0.references.get(name).copied())
    }

    /// Bindings declared along the chain; subclasses override by property.
    pub fn bindings(&self) -> Vec<(String, Binding)> {
        let chain: Vec<&Class> = self.ancestry().collect();
        let mut merged: Vec<(String, Binding)> = Vec::new();
        for class in chain.into_iter().rev() {
            for (property, binding) in &class.0.bindings {
                match merged.iter_mut().find(|(p, _)| p == property) {
                    Some(slot) => slot.1 = binding.clone(),
                    None => merged.push((property.clone(), binding.clone())),
                }
            }
        }
        merged
    }

    /// True when instances of this class bind descendants of class `child`.
    pub fn composes_instance_of(&self, child: &Class) -> bool {
        self.ancestry()
            .any(|c| c.0.composes.iter().any(|composed| child.is_subclass_of(composed)))
    }

    pub fn add_event_handler(
        &self,
        handler: impl Fn(&Graph, EntityId, &ManagedEvent) -> Result<()> + 'static,
    ) {
        self.0.handlers.borrow_mut().push(Rc::new(handler));
    }

    /// Handlers for an instance, base class first.
    pub(crate) fn event_handlers(&self) -> Vec<EventHandler> {
        let chain: Vec<&Class> = self.ancestry().collect();
        chain
            .into_iter()
            .rev()
            .flat_map(|c| c.0.handlers.borrow().clone())
            .collect()
    }

    /// Re-emit every non-core event of property-owned children on the owner.
    pub fn propagate_child_events(&self) {
        self.propagate_child_events_with(|_, _, event| Ok(Some(event.clone())));
    }

    pub fn propagate_child_events_with(
        &self,
        relay: impl Fn(&Graph, EntityId, &ManagedEvent) -> Result<Option<ManagedEvent>> + 'static,
    ) {
        *self.0.child_relay.borrow_mut() = Some(Rc::new(relay));
    }

    pub(crate) fn child_relay(&self) -> Option<ChildRelay> {
        self.ancestry().find_map(|c| c.0.child_relay.borrow().clone())
    }

    pub fn add_observer(&self, spec: ObserverSpec) -> ObserverId {
        let id = spec.id();
        self.0.observers.borrow_mut().push(Rc::new(spec));
        id
    }

    /// Observers for an instance, base class first.
    pub(crate) fn observers(&self) -> Vec<Rc<ObserverSpec>> {
        let chain: Vec<&Class> = self.ancestry().collect();
        chain
            .into_iter()
            .rev()
            .flat_map(|c| c.0.observers.borrow().clone())
            .collect()
    }
}

impl PartialEq for Class {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Class {}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("parent", &self.0.parent.as_ref().map(|p| p.name()))
            .finish()
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct ClassBuilder {
    name: String,
    parent: Option<Class>,
    container: Option<ContainerKind>,
    component: bool,
    hooks: Option<Rc<dyn Lifecycle>>,
    references: HashMap<String, Ownership>,
    bindings: Vec<(String, Binding)>,
    composes: Vec<Class>,
}

impl ClassBuilder {
    fn root(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parent: None,
            container: None,
            component: false,
            hooks: None,
            references: HashMap::new(),
            bindings: Vec::new(),
            composes: Vec::new(),
        }
    }

    pub fn new(name: impl Into<String>) -> Self {
        let mut builder = Self::root("");
        builder.name = name.into();
        builder.parent = Some(Class::managed_object());
        builder
    }

    /// Set the superclass. Container and component traits are inherited.
    pub fn extends(mut self, parent: &Class) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn lifecycle(mut self, hooks: impl Lifecycle + 'static) -> Self {
        self.hooks = Some(Rc::new(hooks));
        self
    }

    /// Declare a reference property without ownership.
    pub fn reference(mut self, name: &str) -> Self {
        self.references.insert(name.to_string(), Ownership::Reference);
        self
    }

    /// Declare a reference property that owns its target.
    pub fn child(mut self, name: &str) -> Self {
        self.references.insert(name.to_string(), Ownership::Child);
        self
    }

    /// Declare a reference property whose target's destruction destroys the
    /// instance.
    pub fn dependency(mut self, name: &str) -> Self {
        self.references.insert(name.to_string(), Ownership::Dependency);
        self
    }

    /// Bind `property` on instances to a value read from the bound parent.
    pub fn bind(mut self, property: &str, binding: Binding) -> Self {
        self.bindings.retain(|(p, _)| p != property);
        self.bindings.push((property.to_string(), binding));
        self
    }

    /// Instances become bound parents for descendants of `class`.
    pub fn composes(mut self, class: &Class) -> Self {
        self.composes.push(class.clone());
        self
    }

    pub fn build(self) -> Class {
        let component = self.component
            || !self.bindings.is_empty()
            || !self.composes.is_empty()
            || self.parent.as_ref().is_some_and(Class::is_component);
        let container = self
            .container
            .or_else(|| self.parent.as_ref().and_then(|p| p.container_kind()));
        let class = Class(Rc::new(ClassInfo {
            id: ClassId::next(),
            name: self.name,
            parent: self.parent,
            container,
            component,
            hooks: self.hooks,
            references: self.references,
            bindings: self.bindings,
            composes: self.composes,
            handlers: RefCell::new(Vec::new()),
            child_relay: RefCell::new(None),
            observers: RefCell::new(Vec::new()),
        }));
        tracing::trace!(class = class.name(), id = class.id().0, "class.define");
        class
    }
}
