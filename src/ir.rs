use std::fmt;

use serde::{Deserialize, Serialize};

/// Program dump handed over by the disassembly front end.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub(crate) struct ProgramDump {
    #[serde(default)]
    pub(crate) classes: Vec<Class>,
}

/// Intermediate representation for a disassembled JVM class.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct Class {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) super_name: Option<String>,
    #[serde(default)]
    pub(crate) interfaces: Vec<String>,
    #[serde(default)]
    pub(crate) methods: Vec<Method>,
}

/// A method signature (`name:descriptor`) and its decoded instructions.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct Method {
    pub(crate) signature: String,
    #[serde(default)]
    pub(crate) instructions: Vec<InstructionRecord>,
}

/// One decoded instruction as emitted by the front end.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct InstructionRecord {
    pub(crate) offset: usize,
    #[serde(flatten)]
    pub(crate) instruction: Instruction,
}

/// Bytecode instruction captured for analysis.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub(crate) struct Instruction {
    pub(crate) opcode: String,
    #[serde(default)]
    pub(crate) operands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) comment: Option<String>,
}

impl Instruction {
    #[cfg(test)]
    pub(crate) fn new(opcode: &str, operands: &[&str], comment: Option<&str>) -> Self {
        Self {
            opcode: opcode.to_string(),
            operands: operands.iter().map(|s| s.to_string()).collect(),
            comment: comment.map(str::to_string),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.opcode)?;
        if !self.operands.is_empty() {
            write!(f, " {}", self.operands.join(", "))?;
        }
        if let Some(comment) = &self.comment {
            write!(f, " {comment}")?;
        }
        Ok(())
    }
}

/// Offset-indexed instruction list of one method. Offsets without an
/// instruction start (operand bytes) hold `None`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct MethodBody {
    pub(crate) slots: Vec<Option<Instruction>>,
}

impl MethodBody {
    pub(crate) fn from_records(records: &[InstructionRecord]) -> Self {
        let len = records.iter().map(|r| r.offset + 1).max().unwrap_or(0);
        let mut slots = vec![None; len];
        for record in records {
            slots[record.offset] = Some(record.instruction.clone());
        }
        Self { slots }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Instruction> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Instructions with their offsets, in offset order.
    pub(crate) fn instructions(&self) -> impl Iterator<Item = (usize, &Instruction)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|instruction| (index, instruction)))
    }

    /// Walk the instructions strictly before `index`, nearest first.
    pub(crate) fn preceding(&self, index: usize) -> impl Iterator<Item = &Instruction> {
        self.slots[..index.min(self.slots.len())]
            .iter()
            .rev()
            .filter_map(Option::as_ref)
    }
}

/// Class and method signature identifying one compiled method.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub(crate) struct MethodKey {
    pub(crate) class: String,
    pub(crate) method: String,
}

impl MethodKey {
    pub(crate) fn new(class: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            method: method.into(),
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class, self.method)
    }
}

/// Target of a call site. `class` is `None` when the receiver could not
/// be narrowed to a single class.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub(crate) struct CallTarget {
    pub(crate) class: Option<String>,
    pub(crate) method: String,
}

impl CallTarget {
    pub(crate) fn new(class: Option<&str>, method: &str) -> Self {
        Self {
            class: class.map(str::to_string),
            method: method.to_string(),
        }
    }

    /// Human-readable label used in rendered n-grams.
    pub(crate) fn label(&self) -> String {
        match &self.class {
            Some(class) => format!("{class}.{}", self.method),
            None => self.method.clone(),
        }
    }
}

/// Call opcode classification used by the dispatch resolution.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
}

impl CallKind {
    pub(crate) fn is_dynamic(self) -> bool {
        matches!(self, CallKind::Virtual | CallKind::Interface)
    }
}
