use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::hierarchy::ClassHierarchy;
use crate::ir::{CallKind, CallTarget, Instruction, MethodBody, MethodKey};
use crate::opcodes::{self, InstructionKind};
use crate::signature::{count_method_args, format_location, parse_call_comment};

/// Command attached to a program point while passes still address cells by index.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Command {
    Return,
    Throw,
    Goto(usize),
    Branches(Vec<usize>),
    Invoke(CallTarget),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Cell {
    pub(crate) index: usize,
    pub(crate) next: Option<usize>,
    pub(crate) command: Option<Command>,
}

impl Cell {
    fn empty(index: usize) -> Self {
        Self {
            index,
            next: None,
            command: None,
        }
    }
}

/// Index-addressed, mutable program points of one method plus its entry.
///
/// The last cell is a `Return` sentinel, so every fallthrough has a target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct CellArray {
    key: MethodKey,
    pub(crate) cells: Vec<Cell>,
    pub(crate) entrance: usize,
}

/// Links each new command cell to the previous one.
struct Chain {
    prev: Option<usize>,
    entrance: Option<usize>,
}

impl Chain {
    fn attach(&mut self, cells: &mut [Cell], index: usize, command: Command) {
        cells[index].command = Some(command);
        match self.prev {
            Some(prev) => cells[prev].next = Some(index),
            None => self.entrance = Some(index),
        }
        self.prev = Some(index);
    }
}

impl CellArray {
    /// Classify instructions into cells, resolving call targets on the way.
    pub(crate) fn from_body(
        key: &MethodKey,
        body: &MethodBody,
        hierarchy: Option<&ClassHierarchy>,
    ) -> Result<Self> {
        let len = body.len();
        let mut cells: Vec<Cell> = (0..=len).map(Cell::empty).collect();
        let mut chain = Chain {
            prev: None,
            entrance: None,
        };
        for index in 0..len {
            let Some(instruction) = body.get(index) else {
                continue;
            };
            let malformed = |detail: String| Error::MalformedInstruction {
                class: key.class.clone(),
                method: key.method.clone(),
                index,
                detail,
            };
            let command = match opcodes::classify(&instruction.opcode) {
                InstructionKind::Return => Some(Command::Return),
                InstructionKind::Throw => Some(Command::Throw),
                InstructionKind::Goto => {
                    let dest = jump_target(instruction, len).map_err(malformed)?;
                    (dest != index + 1).then_some(Command::Goto(dest))
                }
                InstructionKind::Branch => {
                    let dest = jump_target(instruction, len).map_err(malformed)?;
                    (dest != index + 1).then(|| Command::Branches(vec![dest]))
                }
                InstructionKind::Switch => {
                    let mut dests = switch_targets(instruction, len).map_err(malformed)?;
                    dests.retain(|&dest| dest != index + 1);
                    (!dests.is_empty()).then_some(Command::Branches(dests))
                }
                InstructionKind::Invoke(kind) => {
                    let comment = instruction.comment.as_deref().unwrap_or_default();
                    let annotated = parse_call_comment(comment, &key.class)
                        .ok_or_else(|| malformed(format!("cannot decode call target {comment:?}")))?;
                    resolve_call(body, index, kind, annotated, hierarchy)
                        .map_err(malformed)?
                        .map(Command::Invoke)
                }
                InstructionKind::Irrelevant => None,
            };
            if let Some(command) = command {
                chain.attach(&mut cells, index, command);
            }
        }
        chain.attach(&mut cells, len, Command::Return);
        Ok(Self {
            key: key.clone(),
            cells,
            entrance: chain.entrance.unwrap_or(len),
        })
    }

    #[cfg(test)]
    pub(crate) fn from_cells(key: &MethodKey, cells: Vec<Cell>, entrance: usize) -> Self {
        Self {
            key: key.clone(),
            cells,
            entrance,
        }
    }

    fn location(&self, index: usize) -> String {
        format_location(&self.key, index)
    }

    fn next_command_index(&self, index: usize) -> Result<usize> {
        (index..self.cells.len())
            .find(|&i| self.cells[i].command.is_some())
            .ok_or_else(|| Error::invariant(self.location(index), "no command cell at or after"))
    }

    /// Follow a chain of jumps to the first cell that does something else.
    /// A cycle made only of jumps ends at its highest index.
    fn final_destination(&self, dest: usize) -> Result<usize> {
        let mut seen = BTreeSet::new();
        let mut dest = dest;
        loop {
            dest = self.next_command_index(dest)?;
            seen.insert(dest);
            let Some(Command::Goto(target)) = &self.cells[dest].command else {
                return Ok(dest);
            };
            let target = self.next_command_index(*target)?;
            if seen.contains(&target) {
                return Ok(seen.last().copied().unwrap_or(target));
            }
            dest = target;
        }
    }

    /// Rewrite every destination to its final destination until nothing changes.
    pub(crate) fn collapse_gotos(&mut self) -> Result<()> {
        loop {
            let mut simplified = false;
            for index in 0..self.cells.len() {
                if let Some(next) = self.cells[index].next {
                    self.cells[index].next = Some(self.final_destination(next)?);
                }
                match self.cells[index].command.clone() {
                    Some(Command::Goto(target)) => {
                        let target = self.final_destination(target)?;
                        self.cells[index].command = Some(Command::Goto(target));
                    }
                    Some(Command::Branches(targets)) => {
                        let mut dests = targets
                            .iter()
                            .map(|&target| self.final_destination(target))
                            .collect::<Result<Vec<_>>>()?;
                        dests.retain(|&dest| dest != index + 1);
                        dests.sort_unstable();
                        dests.dedup();
                        let next = self.cells[index].next;
                        let command = if dests.is_empty() || next.is_some_and(|n| dests == [n]) {
                            let next = next.ok_or_else(|| {
                                Error::invariant(self.location(index), "branch without fallthrough")
                            })?;
                            simplified = true;
                            Command::Goto(next)
                        } else {
                            Command::Branches(dests)
                        };
                        self.cells[index].command = Some(command);
                    }
                    _ => {}
                }
            }
            if !simplified {
                break;
            }
        }
        self.entrance = self.final_destination(self.entrance)?;
        Ok(())
    }

    /// Walk every reachable cell once, reporting each traversed edge's destination.
    fn walk_edges(&self, mut on_edge: impl FnMut(usize)) -> Result<()> {
        let mut visited = vec![false; self.cells.len()];
        let mut pending = Vec::new();
        let mut index = self.entrance;
        loop {
            while visited[index] {
                match pending.pop() {
                    Some(target) => index = target,
                    None => return Ok(()),
                }
            }
            visited[index] = true;
            let at = index;
            let cell = &self.cells[at];
            let fallthrough = || {
                cell.next
                    .ok_or_else(|| Error::invariant(self.location(at), "missing fallthrough"))
            };
            match &cell.command {
                None => {
                    return Err(Error::invariant(
                        self.location(at),
                        "reachable cell without command",
                    ));
                }
                Some(Command::Return | Command::Throw) => match pending.pop() {
                    Some(target) => index = target,
                    None => return Ok(()),
                },
                Some(Command::Goto(target)) => {
                    on_edge(*target);
                    index = *target;
                }
                Some(Command::Branches(targets)) => {
                    for &target in targets {
                        on_edge(target);
                        pending.push(target);
                    }
                    let next = fallthrough()?;
                    on_edge(next);
                    index = next;
                }
                Some(Command::Invoke(_)) => {
                    let next = fallthrough()?;
                    on_edge(next);
                    index = next;
                }
            }
        }
    }

    pub(crate) fn check_reachable(&self) -> Result<()> {
        self.walk_edges(|_| {})
    }

    /// Point every reference to `old` at `new` instead.
    fn redirect(&mut self, old: usize, new: usize) {
        if self.entrance == old {
            self.entrance = new;
        }
        for cell in &mut self.cells {
            if cell.index != old && cell.next == Some(old) {
                cell.next = Some(new);
            }
            match &mut cell.command {
                Some(Command::Goto(target)) if *target == old => *target = new,
                Some(Command::Branches(targets)) if targets.contains(&old) => {
                    for target in targets.iter_mut() {
                        if *target == old {
                            *target = new;
                        }
                    }
                    targets.sort_unstable();
                    targets.dedup();
                }
                _ => {}
            }
        }
    }

    /// Fold branch cells that fall through into further branch cells.
    pub(crate) fn merge_branches(&mut self) {
        for index in 0..self.cells.len() {
            let Some(Command::Branches(targets)) = &mut self.cells[index].command else {
                continue;
            };
            targets.sort_unstable();
            targets.dedup();
            let mut done = BTreeSet::from([index]);
            let mut next = self.cells[index].next;
            while let Some(current) = next {
                if !done.insert(current) {
                    break;
                }
                let Some(Command::Branches(more)) = self.cells[current].command.clone() else {
                    break;
                };
                let after = self.cells[current].next;
                if let Some(Command::Branches(targets)) = &mut self.cells[index].command {
                    targets.extend(more);
                    targets.retain(|&target| target != current);
                    targets.sort_unstable();
                    targets.dedup();
                }
                if let Some(after) = after {
                    self.redirect(current, after);
                }
                next = after;
            }
        }
    }

    /// Skip consecutive calls to the same target, keeping the first.
    pub(crate) fn remove_repetitions(&mut self) {
        for index in 0..self.cells.len() {
            let Some(Command::Invoke(target)) = self.cells[index].command.clone() else {
                continue;
            };
            let mut done = BTreeSet::from([index]);
            let mut next = self.cells[index].next;
            while let Some(current) = next {
                if !done.insert(current) {
                    break;
                }
                let same = match &self.cells[current].command {
                    Some(Command::Invoke(other)) => *other == target,
                    _ => break,
                };
                let after = self.cells[current].next;
                if same {
                    if let Some(after) = after {
                        self.redirect(current, after);
                    }
                }
                next = after;
            }
        }
    }

    /// Indices reached by at least two edges, counting the entry as one.
    pub(crate) fn merge_points(&self) -> Result<BTreeSet<usize>> {
        let mut incoming: BTreeMap<usize, usize> = BTreeMap::new();
        *incoming.entry(self.entrance).or_default() += 1;
        self.walk_edges(|dest| *incoming.entry(dest).or_default() += 1)?;
        Ok(incoming
            .into_iter()
            .filter(|(_, count)| *count >= 2)
            .map(|(index, _)| index)
            .collect())
    }

    /// Freeze command cells into an immutable graph.
    pub(crate) fn link(&self, merge_points: BTreeSet<usize>) -> Result<MethodGraph> {
        let mut by_index = vec![None; self.cells.len()];
        let mut commands = Vec::new();
        for cell in &self.cells {
            if let Some(command) = &cell.command {
                by_index[cell.index] = Some(commands.len());
                commands.push((cell, command));
            }
        }
        let locate = |index: usize| -> Result<NodeId> {
            let found = self.next_command_index(index)?;
            by_index[found]
                .ok_or_else(|| Error::invariant(self.location(index), "unlinked command cell"))
        };

        let mut nodes = Vec::with_capacity(commands.len());
        for (cell, command) in commands {
            let op = match command {
                Command::Return => Op::Return,
                Command::Throw => Op::Throw,
                Command::Goto(target) => Op::Goto(locate(*target)?),
                Command::Branches(targets) => Op::Branches(
                    targets
                        .iter()
                        .map(|&target| locate(target))
                        .collect::<Result<Vec<_>>>()?,
                ),
                Command::Invoke(target) => Op::Invoke(target.clone()),
            };
            let next = cell.next.map(&locate).transpose()?;
            nodes.push(Node {
                index: cell.index,
                next,
                op,
            });
        }
        let start = locate(self.entrance)?;
        Ok(MethodGraph {
            start,
            nodes,
            by_index,
            merge_points,
        })
    }

    /// Run the optimization passes and freeze the result.
    pub(crate) fn into_graph(mut self, options: CompileOptions) -> Result<MethodGraph> {
        self.collapse_gotos()?;
        self.check_reachable()?;
        self.merge_branches();
        if options.remove_repetition {
            self.remove_repetitions();
        }
        let merge_points = self.merge_points()?;
        debug!(
            method = %self.key,
            cells = self.cells.len(),
            merge_points = merge_points.len(),
            "compiled method"
        );
        self.link(merge_points)
    }
}

fn jump_target(instruction: &Instruction, len: usize) -> std::result::Result<usize, String> {
    match instruction.operands.as_slice() {
        [operand] => parse_target(operand, len),
        operands => Err(format!(
            "{} expects one target, got {operands:?}",
            instruction.opcode
        )),
    }
}

fn switch_targets(instruction: &Instruction, len: usize) -> std::result::Result<Vec<usize>, String> {
    let mut dests = instruction
        .operands
        .iter()
        .map(|operand| {
            let target = operand.rsplit_once(':').map_or(operand.as_str(), |(_, t)| t);
            parse_target(target, len)
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    dests.sort_unstable();
    dests.dedup();
    Ok(dests)
}

fn parse_target(text: &str, len: usize) -> std::result::Result<usize, String> {
    let target: usize = text
        .trim()
        .parse()
        .map_err(|_| format!("invalid jump target {text:?}"))?;
    if target > len {
        return Err(format!("jump target {target} is past the end of the method"));
    }
    Ok(target)
}

/// Decide the call target kept for a call instruction, or `None` to drop it.
fn resolve_call(
    body: &MethodBody,
    index: usize,
    kind: CallKind,
    annotated: CallTarget,
    hierarchy: Option<&ClassHierarchy>,
) -> std::result::Result<Option<CallTarget>, String> {
    if !kind.is_dynamic() {
        return Ok(Some(annotated));
    }
    let Some(hierarchy) = hierarchy else {
        return Ok(Some(CallTarget {
            class: None,
            method: annotated.method,
        }));
    };
    let receiver_is_this = is_receiver_this(body, index, &annotated.method)?;
    let class =
        hierarchy.resolve_dynamic(annotated.class.as_deref(), &annotated.method, receiver_is_this);
    if hierarchy.is_untracked(class.as_deref(), &annotated.method) {
        return Ok(None);
    }
    Ok(Some(CallTarget {
        class,
        method: annotated.method,
    }))
}

/// True when only argument pushes separate a bare `aload_0` from the call.
fn is_receiver_this(
    body: &MethodBody,
    index: usize,
    method: &str,
) -> std::result::Result<bool, String> {
    let args = count_method_args(method)?;
    let mut preceding = body.preceding(index);
    for _ in 0..args {
        match preceding.next() {
            Some(instruction) if opcodes::is_push(&instruction.opcode) => {}
            _ => return Ok(false),
        }
    }
    Ok(preceding.next().is_some_and(|instruction| {
        instruction.opcode == opcodes::LOAD_THIS
            && instruction.operands.is_empty()
            && instruction.comment.is_none()
    }))
}

pub(crate) type NodeId = usize;

/// Operation of a frozen program point. Destinations are node handles.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Op {
    Return,
    Throw,
    Goto(NodeId),
    Branches(Vec<NodeId>),
    Invoke(CallTarget),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Node {
    pub(crate) index: usize,
    pub(crate) next: Option<NodeId>,
    pub(crate) op: Op,
}

/// Immutable compiled method: command nodes, entry node and merge points.
#[derive(Clone, Debug)]
pub(crate) struct MethodGraph {
    nodes: Vec<Node>,
    by_index: Vec<Option<NodeId>>,
    start: NodeId,
    merge_points: BTreeSet<usize>,
}

impl MethodGraph {
    pub(crate) fn start(&self) -> NodeId {
        self.start
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Node holding the command at `index`, if that index has one.
    pub(crate) fn node_at(&self, index: usize) -> Option<NodeId> {
        self.by_index.get(index).copied().flatten()
    }

    pub(crate) fn is_merge_point(&self, index: usize) -> bool {
        self.merge_points.contains(&index)
    }

    #[cfg(test)]
    pub(crate) fn merge_points(&self) -> &BTreeSet<usize> {
        &self.merge_points
    }

    #[cfg(test)]
    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct CompileOptions {
    pub(crate) remove_repetition: bool,
}

/// Compile one method body into its control-flow graph.
pub(crate) fn compile(
    key: &MethodKey,
    body: &MethodBody,
    hierarchy: Option<&ClassHierarchy>,
    options: CompileOptions,
) -> Result<MethodGraph> {
    CellArray::from_body(key, body, hierarchy)?.into_graph(options)
}

/// Compiled graphs addressed by method signature, then class.
#[derive(Clone, Debug, Default)]
pub(crate) struct GraphTable {
    by_method: BTreeMap<String, BTreeMap<String, MethodGraph>>,
}

impl GraphTable {
    pub(crate) fn insert(&mut self, key: MethodKey, graph: MethodGraph) {
        self.by_method
            .entry(key.method)
            .or_default()
            .insert(key.class, graph);
    }

    pub(crate) fn get(&self, key: &MethodKey) -> Option<&MethodGraph> {
        self.by_method.get(&key.method)?.get(&key.class)
    }

    /// Classes that have a compiled body for `method`, sorted by name.
    pub(crate) fn classes_defining(&self, method: &str) -> Option<&BTreeMap<String, MethodGraph>> {
        self.by_method.get(method)
    }

    pub(crate) fn len(&self) -> usize {
        self.by_method.values().map(BTreeMap::len).sum()
    }

    /// All compiled methods ordered by class, then signature.
    pub(crate) fn keys(&self) -> Vec<MethodKey> {
        let mut keys: Vec<MethodKey> = self
            .by_method
            .iter()
            .flat_map(|(method, classes)| {
                classes
                    .keys()
                    .map(move |class| MethodKey::new(class.as_str(), method.as_str()))
            })
            .collect();
        keys.sort();
        keys
    }
}

/// Compile every method body in `bodies`.
///
/// A method whose instructions cannot be decoded is logged and left out;
/// broken graph invariants abort the whole run.
pub(crate) fn compile_all<'a>(
    bodies: impl IntoIterator<Item = (MethodKey, &'a MethodBody)>,
    hierarchy: Option<&ClassHierarchy>,
    options: CompileOptions,
) -> Result<GraphTable> {
    let mut graphs = GraphTable::default();
    let mut rejected = 0;
    for (key, body) in bodies {
        match compile(&key, body, hierarchy, options) {
            Ok(graph) => graphs.insert(key, graph),
            Err(err @ Error::MalformedInstruction { .. }) => {
                error!("skipping method: {err}");
                rejected += 1;
            }
            Err(err) => return Err(err),
        }
    }
    debug!(compiled = graphs.len(), rejected, "compiled program");
    Ok(graphs)
}
