use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use serde::Serialize;
use tracing::error;

use crate::cfg::{GraphTable, MethodGraph, NodeId, Op};
use crate::error::{Error, Result};
use crate::ir::{CallTarget, MethodKey};
use crate::policy::DigPolicy;
use crate::signature::format_location;

/// Tuning knobs of one n-gram search.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct SearchOptions {
    pub(crate) ngram_size: usize,
    /// Non-negative: call-depth budget. Negative: `ngram_size * -max_call_depth`.
    pub(crate) max_call_depth: i64,
    pub(crate) allow_repetitive_ngram: bool,
    pub(crate) no_branch_ngram: bool,
    pub(crate) no_returning_execution_path: bool,
    pub(crate) use_undigged_methods: bool,
    pub(crate) count_branch_in_surface_level: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            ngram_size: 6,
            max_call_depth: -2,
            allow_repetitive_ngram: false,
            no_branch_ngram: false,
            no_returning_execution_path: false,
            use_undigged_methods: false,
            count_branch_in_surface_level: false,
        }
    }
}

impl SearchOptions {
    pub(crate) fn call_depth_budget(&self) -> usize {
        if self.max_call_depth >= 0 {
            self.max_call_depth as usize
        } else {
            self.ngram_size
                .saturating_mul(self.max_call_depth.unsigned_abs() as usize)
        }
    }
}

pub(crate) type FrameId = usize;

/// One live call: the method, the call site currently visited in it, and
/// the frame of its caller.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct StackFrame {
    pub(crate) method: MethodKey,
    pub(crate) index: usize,
    pub(crate) caller: Option<FrameId>,
    pub(crate) depth: usize,
}

/// Hash-consed frames; equal frames share one handle.
#[derive(Debug, Default)]
pub(crate) struct FrameArena {
    frames: Vec<StackFrame>,
    interned: HashMap<StackFrame, FrameId>,
}

impl FrameArena {
    pub(crate) fn intern(&mut self, caller: Option<FrameId>, method: MethodKey, index: usize) -> FrameId {
        let depth = caller.map_or(0, |id| self.frames[id].depth + 1);
        let frame = StackFrame {
            method,
            index,
            caller,
            depth,
        };
        if let Some(id) = self.interned.get(&frame) {
            return *id;
        }
        let id = self.frames.len();
        self.frames.push(frame.clone());
        self.interned.insert(frame, id);
        id
    }

    /// Same method and caller, advanced to another call site.
    pub(crate) fn with_index(&mut self, id: FrameId, index: usize) -> FrameId {
        let frame = &self.frames[id];
        if frame.index == index {
            return id;
        }
        let (caller, method) = (frame.caller, frame.method.clone());
        self.intern(caller, method, index)
    }

    pub(crate) fn get(&self, id: FrameId) -> &StackFrame {
        &self.frames[id]
    }

    /// The frame followed by its callers up to the root.
    pub(crate) fn chain(&self, id: FrameId) -> impl Iterator<Item = &StackFrame> {
        std::iter::successors(Some(&self.frames[id]), |frame| {
            frame.caller.map(|caller| &self.frames[caller])
        })
    }
}

/// One visible step of a gram: the call and the frame it happened in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
struct GramItem<'g> {
    target: &'g CallTarget,
    frame: FrameId,
}

/// Merge points visited by one dig, chained to the trail of its caller.
#[derive(Clone, Debug, Default)]
struct FootmarkTrail {
    marks: Vec<usize>,
    parent: Option<Rc<FootmarkTrail>>,
}

struct PendingBranch<'g> {
    budget: usize,
    gram: Vec<GramItem<'g>>,
    node: NodeId,
    trail: FootmarkTrail,
}

/// One rendered n-gram step.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub(crate) struct GramStep {
    pub(crate) label: String,
    pub(crate) location: String,
    pub(crate) depth: usize,
}

pub(crate) type RenderedNgram = Vec<GramStep>;

/// N-grams found for one root method, keyed by head with distinct tails.
#[derive(Debug)]
pub(crate) struct NgramSet<'g> {
    frames: FrameArena,
    grams: HashMap<GramItem<'g>, HashSet<Vec<GramItem<'g>>>>,
}

impl NgramSet<'_> {
    /// Number of distinct stored n-grams.
    pub(crate) fn len(&self) -> usize {
        self.grams.values().map(HashSet::len).sum()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.grams.is_empty()
    }

    fn step(&self, item: &GramItem<'_>) -> GramStep {
        let frame = self.frames.get(item.frame);
        GramStep {
            label: item.target.label(),
            location: format_location(&frame.method, frame.index),
            depth: frame.depth,
        }
    }

    /// Render grouped by head in sorted order; each group is sorted and
    /// free of duplicates that differ only in internal path.
    pub(crate) fn render(&self) -> Vec<Vec<RenderedNgram>> {
        let mut heads: Vec<_> = self
            .grams
            .iter()
            .map(|(head, tails)| (self.head_key(head), head, tails))
            .collect();
        heads.sort_by(|a, b| a.0.cmp(&b.0));
        heads
            .into_iter()
            .map(|(_, head, tails)| {
                let first = self.step(head);
                let mut group: Vec<RenderedNgram> = tails
                    .iter()
                    .map(|tail| {
                        std::iter::once(first.clone())
                            .chain(tail.iter().map(|item| self.step(item)))
                            .collect()
                    })
                    .collect();
                group.sort();
                group.dedup();
                group
            })
            .collect()
    }

    fn head_key(&self, head: &GramItem<'_>) -> (CallTarget, Vec<(MethodKey, usize, usize)>) {
        let chain = self
            .frames
            .chain(head.frame)
            .map(|frame| (frame.method.clone(), frame.index, frame.depth))
            .collect();
        (head.target.clone(), chain)
    }
}

/// Walk state shared by every dig of one root method.
struct Search<'g, 'p> {
    graphs: &'g GraphTable,
    options: &'p SearchOptions,
    dig_policy: &'p dyn DigPolicy,
    frames: FrameArena,
    found: HashMap<GramItem<'g>, HashSet<Vec<GramItem<'g>>>>,
    root: MethodKey,
    start_index: Option<usize>,
    stack_reported: bool,
}

impl<'g, 'p> Search<'g, 'p> {
    fn new(
        graphs: &'g GraphTable,
        key: &MethodKey,
        options: &'p SearchOptions,
        dig_policy: &'p dyn DigPolicy,
    ) -> Result<Self> {
        if options.ngram_size == 0 {
            return Err(Error::InvalidNgramSize(0));
        }
        Ok(Self {
            graphs,
            options,
            dig_policy,
            frames: FrameArena::default(),
            found: HashMap::new(),
            root: key.clone(),
            start_index: None,
            stack_reported: false,
        })
    }

    fn finish(self) -> NgramSet<'g> {
        NgramSet {
            frames: self.frames,
            grams: self.found,
        }
    }

    fn graph(&self, key: &MethodKey) -> Result<&'g MethodGraph> {
        let graphs: &'g GraphTable = self.graphs;
        graphs
            .get(key)
            .ok_or_else(|| Error::UnknownMethod(key.to_string()))
    }

    /// Enter `method` as a call from `caller`, or as the root when `caller` is `None`.
    fn dig_call(
        &mut self,
        budget: usize,
        gram: Vec<GramItem<'g>>,
        method: &MethodKey,
        caller: Option<FrameId>,
        caller_trail: Option<Rc<FootmarkTrail>>,
        start: Option<NodeId>,
    ) -> Result<()> {
        let graph = self.graph(method)?;
        let start = start.unwrap_or(graph.start());
        let frame = self.frames.intern(caller, method.clone(), graph.node(start).index);
        let trail = FootmarkTrail {
            marks: Vec::new(),
            parent: caller_trail,
        };
        self.dig(budget, gram, graph, frame, start, trail)
    }

    /// Continue in the caller after the call site recorded in `frame`.
    fn dig_return(
        &mut self,
        budget: usize,
        gram: Vec<GramItem<'g>>,
        frame: FrameId,
        caller_trail: &FootmarkTrail,
    ) -> Result<()> {
        let site = self.frames.get(frame);
        let graph = self.graph(&site.method)?;
        let location = format_location(&site.method, site.index);
        let call = graph
            .node_at(site.index)
            .ok_or_else(|| Error::invariant(location.as_str(), "call site has no node"))?;
        let start = graph
            .node(call)
            .next
            .ok_or_else(|| Error::invariant(location.as_str(), "call site has no fallthrough"))?;
        let trail = FootmarkTrail {
            marks: caller_trail.marks.clone(),
            parent: caller_trail.parent.clone(),
        };
        self.dig(budget, gram, graph, frame, start, trail)
    }

    fn dig(
        &mut self,
        budget: usize,
        gram: Vec<GramItem<'g>>,
        graph: &'g MethodGraph,
        frame: FrameId,
        start: NodeId,
        trail: FootmarkTrail,
    ) -> Result<()> {
        let mut pending = Vec::new();
        let mut result = self.walk(budget, gram, graph, frame, start, trail, &mut pending);
        while result.is_ok() {
            let Some(branch) = pending.pop() else {
                break;
            };
            result = self.walk(
                branch.budget,
                branch.gram,
                graph,
                frame,
                branch.node,
                branch.trail,
                &mut pending,
            );
        }
        if result.is_err() {
            self.report_stack(frame);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn walk(
        &mut self,
        mut budget: usize,
        mut gram: Vec<GramItem<'g>>,
        graph: &'g MethodGraph,
        frame: FrameId,
        start: NodeId,
        mut trail: FootmarkTrail,
        pending: &mut Vec<PendingBranch<'g>>,
    ) -> Result<()> {
        let n = self.options.ngram_size;
        let depth = self.frames.get(frame).depth;
        let mut cursor = start;
        loop {
            let node = graph.node(cursor);
            if graph.is_merge_point(node.index) {
                if trail.marks.contains(&node.index) {
                    break;
                }
                trail.marks.push(node.index);
                if self.options.count_branch_in_surface_level || depth > 0 {
                    if budget == 0 {
                        break;
                    }
                    budget -= 1;
                }
            }
            let mut next = node.next;
            match &node.op {
                Op::Invoke(target) => {
                    let site = self.frames.with_index(frame, node.index);
                    if !gram.is_empty() && budget > 0 && self.is_dig_target(target, &gram) {
                        self.expand_call(budget - 1, &gram, target, frame, site, &trail)?;
                    }
                    gram.push(GramItem { target, frame: site });
                    if self.remove_repetition(&mut gram) == 0 && gram.len() >= n {
                        let window = &gram[gram.len() - n..];
                        if self.is_escaping(window[0].frame) || !self.store(window) {
                            break;
                        }
                    }
                }
                Op::Return => {
                    if !self.options.no_returning_execution_path {
                        let caller = self.frames.get(frame).caller;
                        if let (Some(caller), Some(parent)) = (caller, trail.parent.clone()) {
                            self.dig_return(budget, gram, caller, &parent)?;
                        }
                    }
                    break;
                }
                Op::Throw => break,
                Op::Goto(target) => next = Some(*target),
                Op::Branches(targets) => {
                    if !self.options.no_branch_ngram {
                        let seed = tail(&gram, n);
                        for &target in targets {
                            pending.push(PendingBranch {
                                budget,
                                gram: seed.clone(),
                                node: target,
                                trail: trail.clone(),
                            });
                        }
                    }
                }
            }
            cursor = next.ok_or_else(|| {
                let site = self.frames.get(frame);
                Error::invariant(
                    format_location(&site.method, node.index),
                    "control falls off the method",
                )
            })?;
        }
        Ok(())
    }

    fn expand_call(
        &mut self,
        budget: usize,
        gram: &[GramItem<'g>],
        target: &CallTarget,
        frame: FrameId,
        site: FrameId,
        trail: &FootmarkTrail,
    ) -> Result<()> {
        let graphs: &'g GraphTable = self.graphs;
        let Some(classes) = graphs.classes_defining(&target.method) else {
            return Ok(());
        };
        let candidates: Vec<&String> = match &target.class {
            None => classes.keys().collect(),
            Some(class) => classes.keys().filter(|c| *c == class).collect(),
        };
        if candidates.is_empty() || self.is_on_stack(&target.method, frame) {
            return Ok(());
        }
        let caller_trail = Rc::new(trail.clone());
        let seed = tail(gram, self.options.ngram_size);
        for class in candidates {
            let callee = MethodKey::new(class.as_str(), target.method.as_str());
            self.dig_call(
                budget,
                seed.clone(),
                &callee,
                Some(site),
                Some(Rc::clone(&caller_trail)),
                None,
            )?;
        }
        Ok(())
    }

    fn is_dig_target(&self, target: &CallTarget, gram: &[GramItem<'g>]) -> bool {
        if self.options.use_undigged_methods && self.dig_policy.is_undigged(&target.method) {
            return false;
        }
        if target.class.is_none() && target.method.ends_with(":()V") {
            return false;
        }
        gram.iter()
            .rev()
            .take(self.options.ngram_size.saturating_sub(1))
            .all(|item| item.target.method != target.method)
    }

    /// Any frame from `frame` up to the root executing a method of this name.
    fn is_on_stack(&self, method: &str, frame: FrameId) -> bool {
        self.frames
            .chain(frame)
            .any(|frame| frame.method.method == method)
    }

    /// Drop a just-completed repeat of the shortest repeating suffix.
    /// Returns the length of the dropped period, or 0.
    fn remove_repetition(&self, gram: &mut Vec<GramItem<'g>>) -> usize {
        if self.options.allow_repetitive_ngram {
            return 0;
        }
        let len = gram.len();
        for period in 1..=len.min(self.options.ngram_size) / 2 {
            let repeated =
                (1..=period).all(|j| gram[len - j].target == gram[len - j - period].target);
            if repeated {
                gram.truncate(len - period);
                return period;
            }
        }
        0
    }

    fn is_escaping(&self, head: FrameId) -> bool {
        let head = self.frames.get(head);
        if let Some(start) = self.start_index {
            if head.method == self.root && head.index != start {
                return true;
            }
        }
        head.depth != 0
    }

    /// Returns false when the window was already stored.
    fn store(&mut self, window: &[GramItem<'g>]) -> bool {
        let head = window[0];
        self.found
            .entry(head)
            .or_default()
            .insert(window[1..].to_vec())
    }

    fn report_stack(&mut self, frame: FrameId) {
        if self.stack_reported {
            return;
        }
        self.stack_reported = true;
        let stack: Vec<String> = self
            .frames
            .chain(frame)
            .map(|frame| format!("{}:{}", frame.method, frame.index))
            .collect();
        error!(call_stack = %stack.join(" <- "), "n-gram search failed");
    }
}

fn tail<T: Clone>(items: &[T], n: usize) -> Vec<T> {
    items[items.len().saturating_sub(n)..].to_vec()
}

/// Collect every n-gram reachable from the entry of `key`.
pub(crate) fn generate<'g>(
    graphs: &'g GraphTable,
    key: &MethodKey,
    options: &SearchOptions,
    dig_policy: &dyn DigPolicy,
) -> Result<NgramSet<'g>> {
    let mut search = Search::new(graphs, key, options, dig_policy)?;
    search.dig_call(options.call_depth_budget(), Vec::new(), key, None, None, None)?;
    Ok(search.finish())
}

/// Like [`generate`], but one walk per start index, each beginning at the
/// node at that index and keeping only n-grams headed there.
pub(crate) fn generate_from<'g>(
    graphs: &'g GraphTable,
    key: &MethodKey,
    start_indices: &[usize],
    options: &SearchOptions,
    dig_policy: &dyn DigPolicy,
) -> Result<NgramSet<'g>> {
    let mut search = Search::new(graphs, key, options, dig_policy)?;
    let graph = search.graph(key)?;
    for &index in start_indices {
        let start = graph.node_at(index).ok_or_else(|| Error::UnknownStartIndex {
            method: key.to_string(),
            index,
        })?;
        search.start_index = Some(index);
        search.dig_call(
            options.call_depth_budget(),
            Vec::new(),
            key,
            None,
            None,
            Some(start),
        )?;
    }
    Ok(search.finish())
}
