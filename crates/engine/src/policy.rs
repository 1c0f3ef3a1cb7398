//! Transition policy table.
//!
//! Every allowed (from, to) edge of the ticket lifecycle carries its own
//! requirements: which roles may take it, how many photos, whether notes or
//! customer confirmation are mandatory, and which ticket text field the
//! notes land in. The executor consults nothing else to decide whether a
//! transition is legal.
//!
//! A table is validated once at construction and immutable afterwards:
//! - no duplicate (from, to) keys
//! - every non-terminal state has at least one out-edge
//! - terminal states have none
//!
//! [`PolicyTable::standard`] is the built-in table. A TOML policy file made of
//! `[[edge]]` tables can replace it via [`PolicyTable::from_toml_str`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::state::{Role, TicketState};

/// Which ticket text field receives the notes supplied on an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotesField {
    DiagnosisNotes,
    RepairNotes,
    WorkshopNotes,
    CancellationReason,
}

impl NotesField {
    pub fn as_str(self) -> &'static str {
        match self {
            NotesField::DiagnosisNotes => "diagnosis_notes",
            NotesField::RepairNotes => "repair_notes",
            NotesField::WorkshopNotes => "workshop_notes",
            NotesField::CancellationReason => "cancellation_reason",
        }
    }
}

/// Requirements attached to one lifecycle edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyEntry {
    pub from: TicketState,
    pub to: TicketState,
    /// Empty means any role.
    #[serde(default)]
    pub allowed_roles: BTreeSet<Role>,
    #[serde(default)]
    pub min_photos: u32,
    #[serde(default)]
    pub requires_notes: bool,
    #[serde(default)]
    pub requires_customer_confirmation: bool,
    /// The ticket must end up with a technician (payload or already assigned).
    #[serde(default)]
    pub requires_technician: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes_field: Option<NotesField>,
}

impl PolicyEntry {
    fn edge(from: TicketState, to: TicketState, roles: &[Role]) -> Self {
        Self {
            from,
            to,
            allowed_roles: roles.iter().copied().collect(),
            min_photos: 0,
            requires_notes: false,
            requires_customer_confirmation: false,
            requires_technician: false,
            notes_field: None,
        }
    }

    fn notes_into(mut self, field: NotesField) -> Self {
        self.notes_field = Some(field);
        self
    }

    pub fn requires_photos(&self) -> bool {
        self.min_photos > 0
    }

    pub fn allows(&self, role: Role) -> bool {
        self.allowed_roles.is_empty() || self.allowed_roles.contains(&role)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("duplicate policy edge {from} -> {to}")]
    DuplicateEdge { from: TicketState, to: TicketState },
    #[error("terminal state {state} must not have out-edges")]
    TerminalHasEdges { state: TicketState },
    #[error("non-terminal state {state} has no out-edges")]
    NoOutEdges { state: TicketState },
    #[error("invalid policy file: {0}")]
    Parse(String),
    #[error("cannot read policy file {path}: {message}")]
    Io { path: String, message: String },
}

/// Result of [`PolicyTable::analyze`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyAnalysis {
    /// States reachable from the initial state, in lifecycle order.
    pub reachable: Vec<TicketState>,
    pub unreachable: Vec<TicketState>,
    /// Non-terminal states from which no terminal state can be reached.
    pub dead_ends: Vec<TicketState>,
    pub edge_count: usize,
}

impl PolicyAnalysis {
    pub fn is_clean(&self) -> bool {
        self.unreachable.is_empty() && self.dead_ends.is_empty()
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyFile {
    #[serde(rename = "edge", default)]
    edges: Vec<PolicyEntry>,
}

/// Immutable, validated set of lifecycle edges keyed by (from, to).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTable {
    edges: BTreeMap<(TicketState, TicketState), PolicyEntry>,
}

impl PolicyTable {
    /// The built-in field-service lifecycle.
    pub fn standard() -> Self {
        use NotesField::*;
        use Role::*;
        use TicketState::*;

        let cancel_roles = [Supervisor, Admin, System];
        let field_roles = [Technician, Supervisor, Admin];
        let workshop_roles = [Workshop, Admin];

        let mut assign = PolicyEntry::edge(New, Assigned, &[Supervisor, Admin]);
        assign.requires_technician = true;

        let mut diagnose =
            PolicyEntry::edge(Inspecting, Diagnosed, &[Technician]).notes_into(DiagnosisNotes);
        diagnose.min_photos = 1;
        diagnose.requires_notes = true;

        let mut intake =
            PolicyEntry::edge(PickupDevice, InWorkshop, &workshop_roles).notes_into(WorkshopNotes);
        intake.requires_notes = true;

        let mut handover = PolicyEntry::edge(
            ReadyDelivery,
            Completed,
            &[Technician, Workshop, Supervisor, Admin],
        )
        .notes_into(RepairNotes);
        handover.requires_customer_confirmation = true;

        let entries = vec![
            assign,
            PolicyEntry::edge(New, Cancelled, &cancel_roles).notes_into(CancellationReason),
            PolicyEntry::edge(Assigned, Scheduled, &field_roles),
            PolicyEntry::edge(Assigned, Cancelled, &cancel_roles).notes_into(CancellationReason),
            PolicyEntry::edge(Scheduled, OnRoute, &[Technician]),
            PolicyEntry::edge(Scheduled, Cancelled, &cancel_roles).notes_into(CancellationReason),
            PolicyEntry::edge(OnRoute, Arrived, &[Technician]),
            PolicyEntry::edge(Arrived, Inspecting, &[Technician]),
            diagnose,
            PolicyEntry::edge(Diagnosed, Repairing, &field_roles).notes_into(RepairNotes),
            PolicyEntry::edge(Diagnosed, WaitingParts, &field_roles).notes_into(RepairNotes),
            PolicyEntry::edge(Diagnosed, NotFixed, &field_roles).notes_into(RepairNotes),
            PolicyEntry::edge(Diagnosed, PickupDevice, &workshop_roles).notes_into(WorkshopNotes),
            PolicyEntry::edge(Repairing, Completed, &field_roles).notes_into(RepairNotes),
            PolicyEntry::edge(Repairing, WaitingParts, &field_roles).notes_into(RepairNotes),
            PolicyEntry::edge(Repairing, NotFixed, &field_roles).notes_into(RepairNotes),
            PolicyEntry::edge(WaitingParts, Repairing, &[]).notes_into(RepairNotes),
            PolicyEntry::edge(WaitingParts, NotFixed, &field_roles).notes_into(RepairNotes),
            PolicyEntry::edge(WaitingParts, Cancelled, &cancel_roles).notes_into(CancellationReason),
            intake,
            PolicyEntry::edge(InWorkshop, ReadyDelivery, &workshop_roles).notes_into(WorkshopNotes),
            PolicyEntry::edge(InWorkshop, NotFixed, &workshop_roles).notes_into(WorkshopNotes),
            handover,
        ];

        Self {
            edges: entries.into_iter().map(|e| ((e.from, e.to), e)).collect(),
        }
    }

    /// Build a table from explicit entries, enforcing totality.
    pub fn from_entries(entries: Vec<PolicyEntry>) -> Result<Self, PolicyError> {
        let mut edges = BTreeMap::new();
        for entry in entries {
            let key = (entry.from, entry.to);
            if edges.insert(key, entry).is_some() {
                return Err(PolicyError::DuplicateEdge {
                    from: key.0,
                    to: key.1,
                });
            }
        }

        for state in TicketState::ALL {
            let has_edges = edges.keys().any(|(from, _)| *from == state);
            if state.is_terminal() && has_edges {
                return Err(PolicyError::TerminalHasEdges { state });
            }
            if !state.is_terminal() && !has_edges {
                return Err(PolicyError::NoOutEdges { state });
            }
        }

        Ok(Self { edges })
    }

    pub fn from_toml_str(source: &str) -> Result<Self, PolicyError> {
        let file: PolicyFile =
            toml::from_str(source).map_err(|e| PolicyError::Parse(e.to_string()))?;
        Self::from_entries(file.edges)
    }

    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let source = std::fs::read_to_string(path).map_err(|e| PolicyError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&source)
    }

    pub fn requirements_for(&self, from: TicketState, to: TicketState) -> Option<&PolicyEntry> {
        self.edges.get(&(from, to))
    }

    pub fn allowed_targets(&self, from: TicketState) -> BTreeSet<TicketState> {
        self.out_edges(from).map(|e| e.to).collect()
    }

    /// Targets of `from` whose edge admits `role`.
    pub fn allowed_targets_for_role(&self, from: TicketState, role: Role) -> BTreeSet<TicketState> {
        self.out_edges(from)
            .filter(|e| e.allows(role))
            .map(|e| e.to)
            .collect()
    }

    /// A state is terminal when it has no out-edges; validation guarantees
    /// this matches [`TicketState::is_terminal`].
    pub fn is_terminal(&self, state: TicketState) -> bool {
        self.out_edges(state).next().is_none()
    }

    pub fn entries(&self) -> impl Iterator<Item = &PolicyEntry> {
        self.edges.values()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    fn out_edges(&self, from: TicketState) -> impl Iterator<Item = &PolicyEntry> {
        self.edges
            .range((from, TicketState::New)..)
            .take_while(move |((f, _), _)| *f == from)
            .map(|(_, e)| e)
    }

    /// Reachability from the initial state, and non-terminal states that
    /// can never reach a terminal one.
    pub fn analyze(&self) -> PolicyAnalysis {
        let reachable = self.reachable_from(TicketState::INITIAL);

        let can_finish: BTreeSet<TicketState> = TicketState::ALL
            .into_iter()
            .filter(|s| {
                self.reachable_from(*s)
                    .iter()
                    .any(|r| self.is_terminal(*r))
            })
            .collect();

        PolicyAnalysis {
            reachable: reachable.iter().copied().collect(),
            unreachable: TicketState::ALL
                .into_iter()
                .filter(|s| !reachable.contains(s))
                .collect(),
            dead_ends: TicketState::ALL
                .into_iter()
                .filter(|s| !self.is_terminal(*s) && !can_finish.contains(s))
                .collect(),
            edge_count: self.edges.len(),
        }
    }

    fn reachable_from(&self, start: TicketState) -> BTreeSet<TicketState> {
        let mut seen = BTreeSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(state) = queue.pop_front() {
            for next in self.allowed_targets(state) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TicketState::*;

    #[test]
    fn standard_table_is_total() {
        let table = PolicyTable::standard();
        let rebuilt = PolicyTable::from_entries(table.entries().cloned().collect());
        assert_eq!(rebuilt, Ok(table));
    }

    #[test]
    fn standard_table_edges() {
        let table = PolicyTable::standard();
        assert_eq!(table.len(), 23);
        assert_eq!(
            table.allowed_targets(Diagnosed),
            BTreeSet::from([Repairing, WaitingParts, NotFixed, PickupDevice])
        );
        assert_eq!(
            table.allowed_targets(WaitingParts),
            BTreeSet::from([Repairing, NotFixed, Cancelled])
        );
        assert_eq!(table.allowed_targets(ReadyDelivery), BTreeSet::from([Completed]));
    }

    #[test]
    fn terminal_states_have_no_targets() {
        let table = PolicyTable::standard();
        for state in TicketState::TERMINAL {
            assert!(table.is_terminal(state));
            assert!(table.allowed_targets(state).is_empty());
        }
        assert!(!table.is_terminal(New));
    }

    #[test]
    fn requirements_on_gated_edges() {
        let table = PolicyTable::standard();

        let diagnose = table.requirements_for(Inspecting, Diagnosed).unwrap();
        assert!(diagnose.requires_photos());
        assert_eq!(diagnose.min_photos, 1);
        assert!(diagnose.requires_notes);
        assert_eq!(diagnose.notes_field, Some(NotesField::DiagnosisNotes));

        let handover = table.requirements_for(ReadyDelivery, Completed).unwrap();
        assert!(handover.requires_customer_confirmation);

        let repair = table.requirements_for(Diagnosed, Repairing).unwrap();
        assert!(!repair.requires_photos() && !repair.requires_notes);
        assert!(!repair.requires_customer_confirmation);

        assert!(table.requirements_for(New, Completed).is_none());
    }

    #[test]
    fn role_filtering() {
        let table = PolicyTable::standard();
        assert_eq!(
            table.allowed_targets_for_role(Diagnosed, Role::Technician),
            BTreeSet::from([Repairing, WaitingParts, NotFixed])
        );
        assert_eq!(
            table.allowed_targets_for_role(Diagnosed, Role::Workshop),
            BTreeSet::from([PickupDevice])
        );
        // Empty role set admits everyone.
        assert!(table
            .allowed_targets_for_role(WaitingParts, Role::Workshop)
            .contains(&Repairing));
        assert!(table
            .allowed_targets_for_role(Scheduled, Role::Workshop)
            .is_empty());
    }

    #[test]
    fn duplicate_edge_rejected() {
        let mut entries: Vec<PolicyEntry> = PolicyTable::standard().entries().cloned().collect();
        entries.push(PolicyEntry::edge(New, Assigned, &[]));
        assert_eq!(
            PolicyTable::from_entries(entries),
            Err(PolicyError::DuplicateEdge {
                from: New,
                to: Assigned
            })
        );
    }

    #[test]
    fn terminal_out_edge_rejected() {
        let mut entries: Vec<PolicyEntry> = PolicyTable::standard().entries().cloned().collect();
        entries.push(PolicyEntry::edge(Completed, Repairing, &[]));
        assert_eq!(
            PolicyTable::from_entries(entries),
            Err(PolicyError::TerminalHasEdges { state: Completed })
        );
    }

    #[test]
    fn missing_out_edges_rejected() {
        let entries: Vec<PolicyEntry> = PolicyTable::standard()
            .entries()
            .filter(|e| e.from != Arrived)
            .cloned()
            .collect();
        assert_eq!(
            PolicyTable::from_entries(entries),
            Err(PolicyError::NoOutEdges { state: Arrived })
        );
    }

    #[test]
    fn standard_table_analysis_is_clean() {
        let analysis = PolicyTable::standard().analyze();
        assert!(analysis.is_clean(), "{analysis:?}");
        assert_eq!(analysis.reachable.len(), TicketState::ALL.len());
        assert_eq!(analysis.edge_count, 23);
    }

    #[test]
    fn analysis_finds_cycles_without_exit() {
        // assigned leads into a repairing <-> waiting_parts loop with no exit.
        let entries = vec![
            PolicyEntry::edge(New, Assigned, &[]),
            PolicyEntry::edge(New, Cancelled, &[]),
            PolicyEntry::edge(Assigned, Repairing, &[]),
            PolicyEntry::edge(Repairing, WaitingParts, &[]),
            PolicyEntry::edge(WaitingParts, Repairing, &[]),
            PolicyEntry::edge(Scheduled, Completed, &[]),
            PolicyEntry::edge(OnRoute, Completed, &[]),
            PolicyEntry::edge(Arrived, Completed, &[]),
            PolicyEntry::edge(Inspecting, Completed, &[]),
            PolicyEntry::edge(Diagnosed, Completed, &[]),
            PolicyEntry::edge(PickupDevice, Completed, &[]),
            PolicyEntry::edge(InWorkshop, Completed, &[]),
            PolicyEntry::edge(ReadyDelivery, NotFixed, &[]),
        ];
        let analysis = PolicyTable::from_entries(entries).unwrap().analyze();
        assert_eq!(analysis.dead_ends, vec![Assigned, Repairing, WaitingParts]);
        assert!(analysis.unreachable.contains(&Arrived));
        assert!(analysis.unreachable.contains(&Completed));
        assert!(!analysis.is_clean());
    }

    #[test]
    fn policy_file_parses_and_validates() {
        let mut source = String::new();
        for entry in PolicyTable::standard().entries() {
            source.push_str(&format!(
                "[[edge]]\nfrom = \"{}\"\nto = \"{}\"\n",
                entry.from, entry.to
            ));
            if entry.from == Inspecting {
                source.push_str("min_photos = 2\nrequires_notes = true\n");
                source.push_str("notes_field = \"diagnosis_notes\"\n");
            }
            if entry.from == Scheduled && entry.to == OnRoute {
                source.push_str("allowed_roles = [\"technician\"]\n");
            }
        }
        let table = PolicyTable::from_toml_str(&source).unwrap();
        let diagnose = table.requirements_for(Inspecting, Diagnosed).unwrap();
        assert_eq!(diagnose.min_photos, 2);
        assert!(diagnose.requires_notes);
        let travel = table.requirements_for(Scheduled, OnRoute).unwrap();
        assert!(!travel.allows(Role::Supervisor));
        // Unlisted roles default to "any".
        assert!(table
            .requirements_for(New, Assigned)
            .unwrap()
            .allows(Role::Workshop));
    }

    #[test]
    fn policy_file_with_unknown_state_rejected() {
        let source = "[[edge]]\nfrom = \"new\"\nto = \"teleported\"\n";
        assert!(matches!(
            PolicyTable::from_toml_str(source),
            Err(PolicyError::Parse(_))
        ));
    }

    #[test]
    fn policy_file_with_pending_alias_accepted() {
        let mut source = String::new();
        for entry in PolicyTable::standard().entries() {
            let from = if entry.from == New { "pending" } else { entry.from.as_str() };
            source.push_str(&format!("[[edge]]\nfrom = \"{from}\"\nto = \"{}\"\n", entry.to));
        }
        let table = PolicyTable::from_toml_str(&source).unwrap();
        assert!(table.requirements_for(New, Assigned).is_some());
    }

    #[test]
    fn load_reads_policy_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");
        let mut source = String::new();
        for entry in PolicyTable::standard().entries() {
            source.push_str(&format!("[[edge]]\nfrom = \"{}\"\nto = \"{}\"\n", entry.from, entry.to));
        }
        std::fs::write(&path, source).unwrap();

        let table = PolicyTable::load(&path).unwrap();
        assert_eq!(table.len(), PolicyTable::standard().len());

        let missing = PolicyTable::load(&dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(PolicyError::Io { .. })));
    }
}
