//! Composite loop/branch state: a heterogeneous tree of containers and
//! handle leaves, with cycle-guarded traversal that derives a stable
//! path name per leaf (`arg0`, `arg0[2]`, `arg0['k']`, `arg0.field`).

use vx_core::{Index64, VarType};
use vx_ad::AdContext;

use crate::CflowError;

/// State accepted by `while_loop` and `if_stmt`: leaves are composite
/// handles, containers may nest arbitrarily.
#[derive(Debug, Clone)]
pub enum StateTree {
    Leaf(Index64),
    Tuple(Vec<StateTree>),
    List(Vec<StateTree>),
    Dict(Vec<(String, StateTree)>),
    /// A user record that declares its traversable fields.
    Record {
        type_name: String,
        fields: Vec<(String, StateTree)>,
    },
}

impl StateTree {
    #[must_use]
    pub fn leaf(handle: Index64) -> Self {
        Self::Leaf(handle)
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Leaf(_) => "leaf",
            Self::Tuple(_) => "tuple",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Record { .. } => "record",
        }
    }
}

/// Clone a tree, acquiring one reference per leaf.
pub fn retain_state(ctx: &AdContext, state: &StateTree) -> Result<StateTree, CflowError> {
    Ok(match state {
        StateTree::Leaf(handle) => StateTree::Leaf(ctx.retain(*handle)?),
        StateTree::Tuple(items) => StateTree::Tuple(
            items
                .iter()
                .map(|item| retain_state(ctx, item))
                .collect::<Result<_, _>>()?,
        ),
        StateTree::List(items) => StateTree::List(
            items
                .iter()
                .map(|item| retain_state(ctx, item))
                .collect::<Result<_, _>>()?,
        ),
        StateTree::Dict(items) => StateTree::Dict(
            items
                .iter()
                .map(|(key, item)| Ok((key.clone(), retain_state(ctx, item)?)))
                .collect::<Result<_, CflowError>>()?,
        ),
        StateTree::Record { type_name, fields } => StateTree::Record {
            type_name: type_name.clone(),
            fields: fields
                .iter()
                .map(|(field, item)| Ok((field.clone(), retain_state(ctx, item)?)))
                .collect::<Result<_, CflowError>>()?,
        },
    })
}

/// Release every leaf handle of a tree.
pub fn release_state(ctx: &AdContext, state: &StateTree) -> Result<(), CflowError> {
    match state {
        StateTree::Leaf(handle) => {
            if !handle.is_empty() {
                ctx.release(*handle)?;
            }
            Ok(())
        }
        StateTree::Tuple(items) | StateTree::List(items) => {
            for item in items {
                release_state(ctx, item)?;
            }
            Ok(())
        }
        StateTree::Dict(items) => {
            for (_, item) in items {
                release_state(ctx, item)?;
            }
            Ok(())
        }
        StateTree::Record { fields, .. } => {
            for (_, item) in fields {
                release_state(ctx, item)?;
            }
            Ok(())
        }
    }
}

/// One fixed leaf of the traversal order.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub name: String,
    pub kind: &'static str,
    pub ty: VarType,
    pub size: usize,
}

/// Traverses a state tree, fixing the leaf order on the first pass and
/// validating every later pass against it: same names, same kinds, same
/// types, and sizes that stay equal or grow from 1.
pub(crate) struct StateWalker {
    entries: Vec<Entry>,
    labels: Vec<String>,
    first_time: bool,
    entry_pos: usize,
    strict_sizes: bool,
}

impl StateWalker {
    pub fn new(labels: &[&str]) -> Self {
        Self {
            entries: Vec::new(),
            labels: labels.iter().map(|l| (*l).to_owned()).collect(),
            first_time: true,
            entry_pos: 0,
            strict_sizes: true,
        }
    }

    /// A walker that validates structure and types but tolerates lane
    /// counts varying between passes (branch bodies run once per lane
    /// bucket in evaluated mode).
    pub fn lenient(labels: &[&str]) -> Self {
        Self {
            strict_sizes: false,
            ..Self::new(labels)
        }
    }

    /// Collect the current leaf handles in traversal order. The returned
    /// handles are retained; the caller releases them.
    pub fn read(
        &mut self,
        ctx: &AdContext,
        state: &StateTree,
    ) -> Result<Vec<Index64>, CflowError> {
        self.entry_pos = 0;
        let mut stack: Vec<*const StateTree> = Vec::new();
        let mut out = Vec::new();
        self.visit_roots(ctx, state, &mut stack, &mut VisitAction::Read(&mut out))?;
        if !self.first_time && self.entry_pos != self.entries.len() {
            return Err(CflowError::LoopStateChanged {
                name: self
                    .entries
                    .get(self.entry_pos)
                    .map(|e| e.name.clone())
                    .unwrap_or_default(),
                detail: "a previously observed state variable disappeared".to_owned(),
            });
        }
        self.first_time = false;
        Ok(out)
    }

    /// Rebuild the tree with new leaf handles in traversal order,
    /// consuming ownership of every handle exactly once.
    pub fn write(
        &mut self,
        ctx: &AdContext,
        state: &StateTree,
        handles: &[Index64],
    ) -> Result<StateTree, CflowError> {
        self.entry_pos = 0;
        let mut stack: Vec<*const StateTree> = Vec::new();
        let mut position = 0;
        let result = self.visit_roots(
            ctx,
            state,
            &mut stack,
            &mut VisitAction::Write {
                handles,
                position: &mut position,
            },
        )?;
        if position != handles.len() {
            return Err(CflowError::InternalInvariant(format!(
                "state write consumed {position} of {} handles",
                handles.len()
            )));
        }
        self.first_time = false;
        result.ok_or_else(|| {
            CflowError::InternalInvariant("state write produced no tree".to_owned())
        })
    }

    fn visit_roots(
        &mut self,
        ctx: &AdContext,
        state: &StateTree,
        stack: &mut Vec<*const StateTree>,
        action: &mut VisitAction<'_>,
    ) -> Result<Option<StateTree>, CflowError> {
        match state {
            StateTree::Tuple(items) => {
                let mut rebuilt = Vec::with_capacity(items.len());
                for (position, item) in items.iter().enumerate() {
                    let name = self
                        .labels
                        .get(position)
                        .cloned()
                        .unwrap_or_else(|| format!("arg{position}"));
                    if let Some(tree) = self.visit(ctx, item, name, stack, action)? {
                        rebuilt.push(tree);
                    }
                }
                Ok(if rebuilt.is_empty() {
                    None
                } else {
                    Some(StateTree::Tuple(rebuilt))
                })
            }
            _ => self.visit(ctx, state, "arg0".to_owned(), stack, action),
        }
    }

    fn visit(
        &mut self,
        ctx: &AdContext,
        state: &StateTree,
        name: String,
        stack: &mut Vec<*const StateTree>,
        action: &mut VisitAction<'_>,
    ) -> Result<Option<StateTree>, CflowError> {
        // Cycle guard: a container already on the path is skipped rather
        // than recursed into.
        let identity = state as *const StateTree;
        if stack.contains(&identity) {
            return Ok(None);
        }
        stack.push(identity);
        let result = self.visit_inner(ctx, state, name, stack, action);
        stack.pop();
        result
    }

    fn visit_inner(
        &mut self,
        ctx: &AdContext,
        state: &StateTree,
        name: String,
        stack: &mut Vec<*const StateTree>,
        action: &mut VisitAction<'_>,
    ) -> Result<Option<StateTree>, CflowError> {
        match state {
            StateTree::Leaf(handle) => match action {
                VisitAction::Read(out) => {
                    let ty = ctx.ir().var_type(handle.ir_id())?;
                    let size = ctx.ir().var_size(handle.ir_id())?;
                    self.check_entry(&name, "leaf", ty, size)?;
                    out.push(ctx.retain(*handle)?);
                    Ok(Some(StateTree::Leaf(*handle)))
                }
                // Validation applies to the replacement: the tree being
                // rewritten may be a structure-only template.
                VisitAction::Write { handles, position } => {
                    let replacement = *handles.get(**position).ok_or_else(|| {
                        CflowError::InternalInvariant(
                            "state write ran out of handles".to_owned(),
                        )
                    })?;
                    **position += 1;
                    let ty = ctx.ir().var_type(replacement.ir_id())?;
                    let size = ctx.ir().var_size(replacement.ir_id())?;
                    self.check_entry(&name, "leaf", ty, size)?;
                    Ok(Some(StateTree::Leaf(replacement)))
                }
            },
            StateTree::Tuple(items) => {
                let rebuilt = self.visit_sequence(ctx, items, &name, stack, action)?;
                Ok(Some(StateTree::Tuple(rebuilt)))
            }
            StateTree::List(items) => {
                let rebuilt = self.visit_sequence(ctx, items, &name, stack, action)?;
                Ok(Some(StateTree::List(rebuilt)))
            }
            StateTree::Dict(items) => {
                let mut rebuilt = Vec::with_capacity(items.len());
                for (key, item) in items {
                    let child_name = format!("{name}['{key}']");
                    if let Some(tree) = self.visit(ctx, item, child_name, stack, action)? {
                        rebuilt.push((key.clone(), tree));
                    }
                }
                Ok(Some(StateTree::Dict(rebuilt)))
            }
            StateTree::Record { type_name, fields } => {
                let mut rebuilt = Vec::with_capacity(fields.len());
                for (field, item) in fields {
                    let child_name = format!("{name}.{field}");
                    if let Some(tree) = self.visit(ctx, item, child_name, stack, action)? {
                        rebuilt.push((field.clone(), tree));
                    }
                }
                Ok(Some(StateTree::Record {
                    type_name: type_name.clone(),
                    fields: rebuilt,
                }))
            }
        }
    }

    fn visit_sequence(
        &mut self,
        ctx: &AdContext,
        items: &[StateTree],
        name: &str,
        stack: &mut Vec<*const StateTree>,
        action: &mut VisitAction<'_>,
    ) -> Result<Vec<StateTree>, CflowError> {
        let mut rebuilt = Vec::with_capacity(items.len());
        for (position, item) in items.iter().enumerate() {
            let child_name = format!("{name}[{position}]");
            if let Some(tree) = self.visit(ctx, item, child_name, stack, action)? {
                rebuilt.push(tree);
            }
        }
        Ok(rebuilt)
    }

    fn check_entry(
        &mut self,
        name: &str,
        kind: &'static str,
        ty: VarType,
        size: usize,
    ) -> Result<(), CflowError> {
        if self.first_time {
            self.entries.push(Entry {
                name: name.to_owned(),
                kind,
                ty,
                size,
            });
            return Ok(());
        }

        let position = self.entry_pos;
        self.entry_pos += 1;
        let Some(entry) = self.entries.get_mut(position) else {
            return Err(CflowError::LoopStateChanged {
                name: name.to_owned(),
                detail: "a previously unobserved state variable appeared".to_owned(),
            });
        };
        if entry.name != name || entry.kind != kind {
            return Err(CflowError::LoopStateChanged {
                name: entry.name.clone(),
                detail: format!("found '{name}' ({kind}) in its place"),
            });
        }
        if entry.ty != ty {
            return Err(CflowError::LoopStateChanged {
                name: name.to_owned(),
                detail: format!("type changed from {} to {ty}", entry.ty),
            });
        }
        if self.strict_sizes && entry.size != size && entry.size != 1 && size != 1 {
            return Err(CflowError::LoopSizeConflict {
                name: name.to_owned(),
                from: entry.size,
                to: size,
            });
        }
        entry.size = entry.size.max(size);
        Ok(())
    }
}

enum VisitAction<'a> {
    Read(&'a mut Vec<Index64>),
    Write {
        handles: &'a [Index64],
        position: &'a mut usize,
    },
}
