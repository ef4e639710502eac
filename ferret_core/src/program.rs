use crate::env::CompMap;
use rand::Rng;
use std::sync::Arc;

/// An executable test program: a sequence of calls.
///
/// Programs are plain values. Whoever processes one owns it and clones it when
/// it has to outlive the current operation (for example when it is queued for
/// triage while the worker keeps executing the original).
pub trait Program: Clone + Send + Sync + std::fmt::Debug + 'static {
    /// Serialized form, used for diagnostics, hashing and reporting.
    fn serialize(&self) -> Vec<u8>;

    /// Number of calls in the program.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name of the call at `idx`, if there is one.
    fn call_name(&self, idx: usize) -> Option<&str>;
}

/// The program model: generation, mutation and reduction of programs.
///
/// The worker engine never looks inside a program; everything structural
/// goes through this trait.
pub trait ProgramModel: Send + Sync {
    type Prog: Program;
    /// Precomputed weights steering which calls get generated.
    type ChoiceTable: Send + Sync;

    /// Generates a fresh random program of at most `ncalls` calls.
    fn generate<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        ncalls: usize,
        choice_table: &Self::ChoiceTable,
    ) -> Self::Prog;

    /// Mutates `prog` in place. `corpus` is a source of material for splicing.
    fn mutate<R: Rng + ?Sized>(
        &self,
        prog: &mut Self::Prog,
        rng: &mut R,
        ncalls: usize,
        choice_table: &Self::ChoiceTable,
        corpus: &[Arc<Self::Prog>],
    );

    /// Reduces `prog` while `accept(candidate, call_index)` keeps returning
    /// `true`. Returns the reduced program and the new index of `call`.
    fn minimize(
        &self,
        prog: &Self::Prog,
        call: usize,
        accept: &mut dyn FnMut(&Self::Prog, usize) -> bool,
        keep_all_calls: bool,
    ) -> (Self::Prog, usize);

    /// Invokes `exec` on every mutant obtained by replacing an argument of
    /// `call` that matches a comparison operand with the other operand.
    fn mutate_with_hints(
        &self,
        prog: &Self::Prog,
        call: usize,
        comps: &CompMap,
        exec: &mut dyn FnMut(&Self::Prog),
    );

    /// Parses a serialized program, used when loading seed candidates.
    fn deserialize(&self, data: &[u8]) -> Result<Self::Prog, anyhow::Error>;
}
