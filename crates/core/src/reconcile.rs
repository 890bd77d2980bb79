//! Matching of stored facts back onto template fields.
//!
//! Stored facts carry no foreign key to the field that produced them (unless the field declared a
//! control id), so a form reopened for viewing or editing has to work out which fact belongs
//! where. The [`Reconciler`] holds a working pool built once from the stored encounter and
//! withdraws every fact it hands out, so no fact is ever assigned twice.
//!
//! Observation groups are planned per scope before their fields are compiled: every group slot
//! of the scope is ranked against the stored groups of the same grouping concept (see
//! [`supporting_rank`]), slots with a unique best candidate claim it first, and the remaining
//! slots then take what is left in stored order. Any assignment that had to pick between several
//! remaining candidates raises the guessing indicator.

use crate::fact::{Encounter, FactValue, FormPath, Obs, Order};
use crate::{FormError, FormResult};
use formentry_types::{ConceptId, FactId};
use std::collections::{BTreeSet, HashSet, VecDeque};

/// Rank that disqualifies a stored group outright.
const INSURMOUNTABLE: i32 = -1000;

/// Restriction on the coded value a field accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerFilter {
    Any,
    /// The field represents one specific answer (a checkbox).
    Exactly(ConceptId),
    /// The field offers an explicit answer set.
    OneOf(Vec<ConceptId>),
    /// The field is a checkbox storing one boolean value.
    Boolean(bool),
}

impl AnswerFilter {
    pub fn accepts(&self, obs: &Obs) -> bool {
        match self {
            Self::Any => true,
            Self::Exactly(answer) => obs.value_coded() == Some(*answer),
            Self::OneOf(answers) => obs.value_coded().is_some_and(|v| answers.contains(&v)),
            Self::Boolean(expected) => matches!(obs.value, Some(FactValue::Boolean(b)) if b == *expected),
        }
    }
}

/// A question (and optional expected answer) declared inside an obs group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupComponent {
    pub question: ConceptId,
    pub answer: Option<ConceptId>,
    /// For a field offering several answers, how many answers of the set are left counting this
    /// one; `None` for a field that is not part of such a set.
    pub remaining_in_set: Option<usize>,
}

impl GroupComponent {
    pub fn new(question: ConceptId, answer: Option<ConceptId>) -> Self {
        Self {
            question,
            answer,
            remaining_in_set: None,
        }
    }

    /// One component per answer of an answer set, counting down to 1.
    pub fn answer_set(question: ConceptId, answers: &[ConceptId]) -> Vec<Self> {
        answers
            .iter()
            .enumerate()
            .map(|(i, answer)| Self {
                question,
                answer: Some(*answer),
                remaining_in_set: Some(answers.len() - i),
            })
            .collect()
    }
}

/// An `<obsgroup>` of the template, described by what it asks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSlot {
    pub concept: ConceptId,
    pub components: Vec<GroupComponent>,
}

/// Scores how well a stored group's members support a slot's components.
///
/// Each member that matches a component's question (and its expected answer, when it has one)
/// adds 1, plus 1 more for an expected answer. A member that answers a question differently
/// than the component expects disqualifies the group, unless the component is one of several
/// alternatives in an answer set and is not the last of them. A member with a question match but
/// no coded answer makes the rank 0.
pub fn supporting_rank(components: &[GroupComponent], members: &[&Obs]) -> i32 {
    let mut rank = 0;
    for obs in members {
        let mut matched_questions = HashSet::new();
        for component in components {
            let question_matches = component.question == obs.concept;
            let answer_matches = component
                .answer
                .map_or(true, |answer| obs.value_coded() == Some(answer));

            if question_matches && !answer_matches {
                if matched_questions.contains(&component.question) {
                    continue;
                }
                if obs.value_coded().is_none() {
                    return 0;
                }
                match component.remaining_in_set {
                    Some(1) | None => return INSURMOUNTABLE,
                    Some(_) => {}
                }
            } else if question_matches {
                if component.answer.is_some() {
                    rank += 1;
                }
                matched_questions.insert(component.question);
                rank += 1;
            }
        }
    }
    rank
}

fn is_reserved(reserved: &BTreeSet<String>, obs: &Obs) -> bool {
    obs.form_path
        .as_ref()
        .and_then(FormPath::control_id)
        .is_some_and(|c| reserved.contains(c))
}

/// Which stored container a scope reads from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum ScopeOwner {
    /// A group slot with no stored group behind it.
    #[default]
    Unmatched,
    Root,
    Group(FactId),
}

impl ScopeOwner {
    /// True if a fact whose direct parent is `parent` lives in this scope.
    fn holds(self, parent: Option<FactId>) -> bool {
        match (self, parent) {
            (Self::Root, None) => true,
            (Self::Group(id), Some(parent)) => id == parent,
            _ => false,
        }
    }
}

/// Facts visible to the fields of one scope: the encounter root or a matched group.
#[derive(Debug, Default)]
struct Scope {
    owner: ScopeOwner,
    singles: Vec<Obs>,
    groups: Vec<Obs>,
    /// Assignments for the group slots of this scope, in document order.
    plan: VecDeque<Option<Obs>>,
}

impl Scope {
    fn from_obs<'a>(owner: ScopeOwner, obs: impl Iterator<Item = &'a Obs>) -> Self {
        let (groups, singles) = obs
            .filter(|o| !o.is_voided())
            .cloned()
            .partition(|o: &Obs| o.active_members().next().is_some());
        Self {
            owner,
            singles,
            groups,
            plan: VecDeque::new(),
        }
    }
}

/// Collects active observations carrying a control path, paired with their direct parent group.
fn collect_tagged(obs: &[Obs], parent: Option<FactId>, out: &mut Vec<(Option<FactId>, Obs)>) {
    for o in obs.iter().filter(|o| !o.is_voided()) {
        if o.form_path.is_some() {
            out.push((parent, o.clone()));
        }
        collect_tagged(&o.members, Some(o.id), out);
    }
}

/// Working pool of stored facts for one session.
#[derive(Debug, Default)]
pub struct Reconciler {
    scopes: Vec<Scope>,
    orders: Vec<Order>,
    /// Active observations at any depth that carry a control path, with their parent group.
    tagged: Vec<(Option<FactId>, Obs)>,
    /// Control ids declared by the template; facts carrying them are only found by control id.
    reserved: BTreeSet<String>,
    claimed: HashSet<FactId>,
    guessing: bool,
}

impl Reconciler {
    /// A pool with nothing in it, used for new encounters.
    pub fn empty() -> Self {
        Self {
            scopes: vec![Scope::default()],
            ..Self::default()
        }
    }

    /// Builds the pool from a snapshot of the stored encounter.
    pub fn new(encounter: Option<&Encounter>) -> Self {
        let Some(encounter) = encounter else {
            return Self::empty();
        };
        let mut tagged = Vec::new();
        collect_tagged(&encounter.obs, None, &mut tagged);
        Self {
            scopes: vec![Scope::from_obs(ScopeOwner::Root, encounter.obs.iter())],
            orders: encounter.active_orders().cloned().collect(),
            tagged,
            reserved: BTreeSet::new(),
            claimed: HashSet::new(),
            guessing: false,
        }
    }

    /// Marks control ids declared by the template. Facts carrying one of them are withheld from
    /// concept lookups and only found through [`Reconciler::take_by_control_id`].
    pub fn reserve(&mut self, control_ids: impl IntoIterator<Item = String>) {
        self.reserved.extend(control_ids);
    }

    pub fn is_guessing(&self) -> bool {
        self.guessing
    }

    /// Number of unclaimed stored groups with `concept` at the encounter root.
    pub fn stored_group_count(&self, concept: ConceptId) -> usize {
        self.scopes.first().map_or(0, |root| {
            root.groups
                .iter()
                .filter(|g| g.concept == concept && !self.claimed.contains(&g.id))
                .count()
        })
    }

    /// Decides which stored group each slot of the current scope gets.
    ///
    /// The result is consumed slot by slot through [`Reconciler::enter_group`].
    pub fn plan_groups(&mut self, slots: &[GroupSlot]) {
        let Some(scope) = self.scopes.last_mut() else {
            return;
        };
        let claimed = &self.claimed;
        let mut candidates: Vec<Obs> = std::mem::take(&mut scope.groups)
            .into_iter()
            .filter(|g| !claimed.contains(&g.id))
            .collect();
        let mut plan: Vec<Option<Obs>> = vec![None; slots.len()];
        let mut deferred = Vec::new();

        for (index, slot) in slots.iter().enumerate() {
            let mut top = 0;
            let mut best = Vec::new();
            for (position, candidate) in candidates.iter().enumerate() {
                if candidate.concept != slot.concept {
                    continue;
                }
                let members: Vec<&Obs> = candidate
                    .active_members()
                    .filter(|m| !claimed.contains(&m.id))
                    .collect();
                let rank = supporting_rank(&slot.components, &members);
                if rank > top {
                    top = rank;
                    best.clear();
                    best.push(position);
                } else if rank == top && rank > 0 {
                    best.push(position);
                }
            }
            if let [only] = best[..] {
                let group = candidates.remove(only);
                tracing::debug!(
                    "group slot {index} (concept {}) uniquely matched stored group {} with rank {top}",
                    slot.concept,
                    group.id
                );
                plan[index] = Some(group);
            } else {
                tracing::debug!(
                    "group slot {index} (concept {}) deferred: {} candidates share rank {top}",
                    slot.concept,
                    best.len()
                );
                deferred.push(index);
            }
        }

        let mut guessed = false;
        for index in deferred {
            let concept = slots[index].concept;
            let contenders = candidates.iter().filter(|g| g.concept == concept).count();
            let Some(position) = candidates.iter().position(|g| g.concept == concept) else {
                continue;
            };
            if contenders > 1 {
                guessed = true;
            }
            let group = candidates.remove(position);
            tracing::debug!(
                "group slot {index} (concept {concept}) took stored group {} out of {contenders} remaining",
                group.id
            );
            plan[index] = Some(group);
        }

        scope.groups = candidates;
        scope.plan = plan.into();
        if guessed {
            self.guessing = true;
        }
    }

    /// Opens the scope of the next planned group slot and returns the stored group assigned to
    /// it. An unmatched slot opens an empty scope.
    pub fn enter_group(&mut self) -> Option<Obs> {
        let assigned = self
            .scopes
            .last_mut()
            .and_then(|scope| scope.plan.pop_front())
            .flatten();
        let scope = match &assigned {
            Some(group) => Scope::from_obs(ScopeOwner::Group(group.id), group.members.iter()),
            None => Scope::default(),
        };
        if let Some(group) = &assigned {
            self.claimed.insert(group.id);
        }
        self.scopes.push(scope);
        assigned
    }

    pub fn exit_group(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Withdraws the first stored observation of `concept` in the current scope that passes
    /// `filter`.
    pub fn take_obs(&mut self, concept: ConceptId, filter: &AnswerFilter) -> Option<Obs> {
        let scope = self.scopes.last_mut()?;
        let (claimed, reserved) = (&self.claimed, &self.reserved);
        let eligible: Vec<usize> = scope
            .singles
            .iter()
            .enumerate()
            .filter(|(_, o)| {
                o.concept == concept
                    && filter.accepts(o)
                    && !claimed.contains(&o.id)
                    && !is_reserved(reserved, o)
            })
            .map(|(i, _)| i)
            .collect();
        let taken = scope.singles.remove(*eligible.first()?);
        if eligible.len() > 1 {
            tracing::debug!(
                "concept {concept}: picked fact {} out of {} indistinguishable candidates",
                taken.id,
                eligible.len()
            );
            self.guessing = true;
        }
        self.claimed.insert(taken.id);
        Some(taken)
    }

    /// Looks a fact up by the control id recorded on it, within the current scope.
    ///
    /// Falls back to [`Reconciler::take_obs`] when no fact of the scope carries the control id and
    /// passes `filter`, so facts stored before the field declared one are still found.
    ///
    /// # Errors
    ///
    /// Returns `FormError::AmbiguousControlId` if more than one active fact of the scope carries
    /// the id.
    pub fn take_by_control_id(
        &mut self,
        control_id: &str,
        concept: ConceptId,
        filter: &AnswerFilter,
    ) -> FormResult<Option<Obs>> {
        let owner = self.scopes.last().map_or(ScopeOwner::Unmatched, |s| s.owner);
        let matches: Vec<usize> = self
            .tagged
            .iter()
            .enumerate()
            .filter(|(_, (parent, o))| {
                owner.holds(*parent)
                    && o.concept == concept
                    && !self.claimed.contains(&o.id)
                    && o.form_path.as_ref().and_then(FormPath::control_id) == Some(control_id)
            })
            .map(|(i, _)| i)
            .collect();
        match matches[..] {
            [] => Ok(self.take_obs(concept, filter)),
            [only] if !filter.accepts(&self.tagged[only].1) => Ok(self.take_obs(concept, filter)),
            [only] => {
                let (_, obs) = self.tagged.remove(only);
                tracing::debug!("control id '{control_id}' matched fact {}", obs.id);
                self.claimed.insert(obs.id);
                Ok(Some(obs))
            }
            _ => Err(FormError::AmbiguousControlId(control_id.to_owned())),
        }
    }

    /// Withdraws the first stored active order of `concept`.
    pub fn take_order(&mut self, concept: ConceptId) -> Option<Order> {
        let position = self.orders.iter().position(|o| o.concept == concept)?;
        Some(self.orders.remove(position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    const GROUP: ConceptId = ConceptId::new(100);
    const QUESTION: ConceptId = ConceptId::new(1);

    fn now() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2024-03-01 10:00", "%Y-%m-%d %H:%M").expect("datetime")
    }

    fn coded(question: ConceptId, answer: Option<u32>) -> Obs {
        Obs::new(question, answer.map(|a| FactValue::Coded(ConceptId::new(a))), now())
    }

    fn group_answering(answer: Option<u32>) -> Obs {
        Obs::group(GROUP, now()).with_member(coded(QUESTION, answer))
    }

    fn slot_expecting(answer: u32) -> GroupSlot {
        GroupSlot {
            concept: GROUP,
            components: vec![GroupComponent::new(QUESTION, Some(ConceptId::new(answer)))],
        }
    }

    fn encounter_with(obs: Vec<Obs>) -> Encounter {
        let mut encounter = Encounter::new(formentry_types::PersonId::new(1), now());
        encounter.obs = obs;
        encounter
    }

    #[test]
    fn test_rank_counts_question_and_answer_matches() {
        let member = coded(QUESTION, Some(5));
        let components = [GroupComponent::new(QUESTION, Some(ConceptId::new(5)))];
        assert_eq!(supporting_rank(&components, &[&member]), 2);

        let open = [GroupComponent::new(QUESTION, None)];
        assert_eq!(supporting_rank(&open, &[&member]), 1);
    }

    #[test]
    fn test_rank_rejects_contradicting_answer() {
        let member = coded(QUESTION, Some(6));
        let components = [GroupComponent::new(QUESTION, Some(ConceptId::new(5)))];
        assert_eq!(supporting_rank(&components, &[&member]), INSURMOUNTABLE);
    }

    #[test]
    fn test_rank_is_zero_for_missing_answer() {
        let member = coded(QUESTION, None);
        let components = [GroupComponent::new(QUESTION, Some(ConceptId::new(5)))];
        assert_eq!(supporting_rank(&components, &[&member]), 0);
    }

    #[test]
    fn test_rank_tolerates_other_answers_of_a_set() {
        let answers = [ConceptId::new(5), ConceptId::new(6), ConceptId::new(7)];
        let components = GroupComponent::answer_set(QUESTION, &answers);
        assert_eq!(components[2].remaining_in_set, Some(1));

        assert_eq!(supporting_rank(&components, &[&coded(QUESTION, Some(6))]), 2);
        assert_eq!(supporting_rank(&components, &[&coded(QUESTION, Some(7))]), 2);
        assert_eq!(supporting_rank(&components, &[&coded(QUESTION, Some(9))]), INSURMOUNTABLE);
    }

    #[test]
    fn test_plan_prefers_discriminating_answers() {
        let stored = encounter_with(vec![group_answering(Some(3)), group_answering(Some(2))]);
        let mut reconciler = Reconciler::new(Some(&stored));
        reconciler.plan_groups(&[slot_expecting(2), slot_expecting(3)]);

        let first = reconciler.enter_group().expect("slot 1 matched");
        reconciler.exit_group();
        let second = reconciler.enter_group().expect("slot 2 matched");
        reconciler.exit_group();

        assert_eq!(first.members[0].value_coded(), Some(ConceptId::new(2)));
        assert_eq!(second.members[0].value_coded(), Some(ConceptId::new(3)));
        assert!(!reconciler.is_guessing());
    }

    #[test]
    fn test_plan_guesses_between_indistinguishable_groups() {
        let open = GroupSlot {
            concept: GROUP,
            components: vec![GroupComponent::new(QUESTION, None)],
        };
        let stored = encounter_with(vec![group_answering(Some(4)), group_answering(Some(4))]);
        let mut reconciler = Reconciler::new(Some(&stored));
        reconciler.plan_groups(&[open.clone(), open]);

        let a = reconciler.enter_group().expect("matched");
        reconciler.exit_group();
        let b = reconciler.enter_group().expect("matched");
        reconciler.exit_group();

        assert_ne!(a.id, b.id);
        assert!(reconciler.is_guessing());
    }

    #[test]
    fn test_unmatched_slot_opens_empty_scope() {
        let stored = encounter_with(vec![coded(QUESTION, Some(5))]);
        let mut reconciler = Reconciler::new(Some(&stored));
        reconciler.plan_groups(&[slot_expecting(2)]);

        assert!(reconciler.enter_group().is_none());
        assert!(reconciler.take_obs(QUESTION, &AnswerFilter::Any).is_none());
        reconciler.exit_group();
        assert!(reconciler.take_obs(QUESTION, &AnswerFilter::Any).is_some());
    }

    #[test]
    fn test_take_obs_withdraws_and_flags_ties() {
        let stored = encounter_with(vec![coded(QUESTION, Some(5)), coded(QUESTION, Some(5))]);
        let mut reconciler = Reconciler::new(Some(&stored));

        let first = reconciler.take_obs(QUESTION, &AnswerFilter::Any).expect("first");
        assert!(reconciler.is_guessing());
        let second = reconciler.take_obs(QUESTION, &AnswerFilter::Any).expect("second");
        assert_ne!(first.id, second.id);
        assert!(reconciler.take_obs(QUESTION, &AnswerFilter::Any).is_none());
    }

    #[test]
    fn test_answer_filter_excludes_other_answers() {
        let stored = encounter_with(vec![coded(QUESTION, Some(5))]);
        let mut reconciler = Reconciler::new(Some(&stored));
        assert!(reconciler
            .take_obs(QUESTION, &AnswerFilter::Exactly(ConceptId::new(6)))
            .is_none());
        assert!(reconciler
            .take_obs(QUESTION, &AnswerFilter::OneOf(vec![ConceptId::new(5)]))
            .is_some());
        assert!(!reconciler.is_guessing());
    }

    #[test]
    fn test_control_id_lookup_and_reservation() {
        let mut tagged = coded(QUESTION, Some(5));
        tagged.form_path = Some(FormPath::for_control("HtmlFormEntry", "F", "1", "q"));
        let plain = coded(QUESTION, Some(6));
        let stored = encounter_with(vec![tagged.clone(), plain.clone()]);
        let mut reconciler = Reconciler::new(Some(&stored));
        reconciler.reserve(["q".to_owned()]);

        let untagged = reconciler.take_obs(QUESTION, &AnswerFilter::Any).expect("plain fact");
        assert_eq!(untagged.id, plain.id);
        let found = reconciler
            .take_by_control_id("q", QUESTION, &AnswerFilter::Any)
            .expect("no ambiguity")
            .expect("found");
        assert_eq!(found.id, tagged.id);
        assert!(!reconciler.is_guessing());
    }

    #[test]
    fn test_ambiguous_control_id() {
        let path = FormPath::for_control("HtmlFormEntry", "F", "1", "q");
        let mut a = coded(QUESTION, Some(5));
        a.form_path = Some(path.clone());
        let mut b = coded(QUESTION, Some(6));
        b.form_path = Some(path);
        let stored = encounter_with(vec![a, b]);
        let mut reconciler = Reconciler::new(Some(&stored));

        let err = reconciler
            .take_by_control_id("q", QUESTION, &AnswerFilter::Any)
            .unwrap_err();
        assert!(matches!(err, FormError::AmbiguousControlId(id) if id == "q"));
    }

    #[test]
    fn test_control_id_stays_inside_the_open_group() {
        let detail = ConceptId::new(2);
        let mut member = Obs::new(detail, Some(FactValue::Text("left".into())), now());
        member.form_path = Some(FormPath::for_control("HtmlFormEntry", "F", "1", "q"));
        let first = group_answering(Some(2));
        let second = group_answering(Some(3)).with_member(member.clone());
        let stored = encounter_with(vec![first.clone(), second.clone()]);
        let mut reconciler = Reconciler::new(Some(&stored));
        reconciler.reserve(["q".to_owned()]);
        reconciler.plan_groups(&[slot_expecting(2), slot_expecting(3)]);

        assert_eq!(reconciler.enter_group().map(|g| g.id), Some(first.id));
        let found = reconciler
            .take_by_control_id("q", detail, &AnswerFilter::Any)
            .expect("no ambiguity");
        assert!(found.is_none());
        reconciler.exit_group();

        assert_eq!(reconciler.enter_group().map(|g| g.id), Some(second.id));
        let found = reconciler
            .take_by_control_id("q", detail, &AnswerFilter::Any)
            .expect("no ambiguity");
        assert_eq!(found.map(|o| o.id), Some(member.id));
    }

    #[test]
    fn test_control_id_match_respects_answer_filter() {
        let mut tagged = Obs::new(QUESTION, Some(FactValue::Boolean(false)), now());
        tagged.form_path = Some(FormPath::for_control("HtmlFormEntry", "F", "1", "q"));
        let stored = encounter_with(vec![tagged]);
        let mut reconciler = Reconciler::new(Some(&stored));
        reconciler.reserve(["q".to_owned()]);

        let found = reconciler
            .take_by_control_id("q", QUESTION, &AnswerFilter::Boolean(true))
            .expect("no ambiguity");
        assert!(found.is_none());
    }

    #[test]
    fn test_stored_group_count_ignores_voided_groups() {
        let mut voided = group_answering(Some(1));
        voided.void(&crate::fact::VoidInfo {
            reason: "x".into(),
            voided_by: None,
            voided_at: now(),
        });
        let stored = encounter_with(vec![group_answering(Some(1)), voided, group_answering(None)]);
        let reconciler = Reconciler::new(Some(&stored));
        assert_eq!(reconciler.stored_group_count(GROUP), 2);
    }
}
