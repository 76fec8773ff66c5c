//! The migration plan: an ordered catalog of table specs.
//!
//! [`MigrationPlan::new`] validates every spec and sorts the tables so that each
//! table follows all of its dependencies. The sort is stable: tables with no
//! ordering constraint between them keep their configuration order. Nothing in
//! this module touches a database except [`validate_schema`].

mod spec;
mod transform;

pub use spec::{ColumnMapping, Literal, TableSpec};
pub use transform::Transform;

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::core::traits::TableReader;
use crate::error::{PlanError, Result};

/// Validated, dependency-ordered table specs.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    tables: Vec<TableSpec>,
}

impl MigrationPlan {
    /// Validate `specs` and sort them into dependency order.
    pub fn new(specs: Vec<TableSpec>) -> std::result::Result<Self, PlanError> {
        let mut names = HashSet::new();
        for spec in &specs {
            if !names.insert(spec.destination.as_str()) {
                return Err(PlanError::DuplicateTable(spec.destination.clone()));
            }
        }

        for spec in &specs {
            for dep in &spec.depends_on {
                if dep == &spec.destination {
                    return Err(PlanError::SelfDependency(spec.destination.clone()));
                }
                if !names.contains(dep.as_str()) {
                    return Err(PlanError::UnknownTable {
                        table: spec.destination.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            spec.validate()?;
        }

        let tables = topological_sort(specs)?;
        debug!(
            "Resolved plan order: {}",
            tables.iter().map(TableSpec::name).collect::<Vec<_>>().join(", ")
        );
        Ok(Self { tables })
    }

    /// All tables, in dependency order.
    pub fn tables(&self) -> &[TableSpec] {
        &self.tables
    }

    /// Destination table names, in dependency order.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.destination.clone()).collect()
    }

    /// Look a table up by destination name.
    pub fn get(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.destination == name)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// The named tables plus all their transitive dependencies, in plan order.
    ///
    /// An empty selection selects the whole plan.
    pub fn select(&self, names: &[String]) -> std::result::Result<Vec<TableSpec>, PlanError> {
        if names.is_empty() {
            return Ok(self.tables.clone());
        }

        let mut wanted: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = Vec::new();
        for name in names {
            let spec = self
                .get(name)
                .ok_or_else(|| PlanError::UnknownSelection(name.clone()))?;
            stack.push(spec.name());
        }

        while let Some(name) = stack.pop() {
            if !wanted.insert(name) {
                continue;
            }
            if let Some(spec) = self.get(name) {
                stack.extend(spec.depends_on.iter().map(String::as_str));
            }
        }

        Ok(self
            .tables
            .iter()
            .filter(|t| wanted.contains(t.name()))
            .cloned()
            .collect())
    }
}

/// Stable Kahn's algorithm: on each pass, emit the first table in configuration
/// order whose dependencies have all been emitted.
fn topological_sort(specs: Vec<TableSpec>) -> std::result::Result<Vec<TableSpec>, PlanError> {
    let mut remaining = specs;
    let mut emitted: HashSet<String> = HashSet::new();
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let ready = remaining
            .iter()
            .position(|s| s.depends_on.iter().all(|d| emitted.contains(d)));

        match ready {
            Some(index) => {
                let spec = remaining.remove(index);
                emitted.insert(spec.destination.clone());
                ordered.push(spec);
            }
            None => {
                return Err(PlanError::CyclicDependency {
                    cycle: find_cycle(&remaining),
                })
            }
        }
    }

    Ok(ordered)
}

/// Walk dependency edges among the unsorted tables until a table repeats.
///
/// Every unsorted table has at least one unsorted dependency, so the walk
/// always closes a cycle.
fn find_cycle(remaining: &[TableSpec]) -> Vec<String> {
    let by_name: HashMap<&str, &TableSpec> =
        remaining.iter().map(|s| (s.name(), s)).collect();

    let mut path: Vec<&str> = Vec::new();
    let mut current = match remaining.first() {
        Some(spec) => spec.name(),
        None => return Vec::new(),
    };

    loop {
        if let Some(start) = path.iter().position(|n| *n == current) {
            let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
            cycle.push(current.to_string());
            return cycle;
        }
        path.push(current);

        let next = by_name.get(current).and_then(|spec| {
            spec.depends_on
                .iter()
                .map(String::as_str)
                .find(|d| by_name.contains_key(d))
        });
        match next {
            Some(next) => current = next,
            None => return path.iter().map(|n| n.to_string()).collect(),
        }
    }
}

/// Group tables into dependency levels.
///
/// Level 0 holds tables with no dependency inside `tables`; level n holds tables
/// whose deepest dependency sits at level n-1. `tables` must be in plan order.
pub fn dependency_levels(tables: &[TableSpec]) -> Vec<Vec<TableSpec>> {
    let mut level_of: HashMap<&str, usize> = HashMap::new();
    let mut levels: Vec<Vec<TableSpec>> = Vec::new();

    for spec in tables {
        let level = spec
            .depends_on
            .iter()
            .filter_map(|d| level_of.get(d.as_str()))
            .map(|l| l + 1)
            .max()
            .unwrap_or(0);
        level_of.insert(spec.name(), level);
        if levels.len() <= level {
            levels.resize_with(level + 1, Vec::new);
        }
        levels[level].push(spec.clone());
    }

    levels
}

/// Check every spec against the live schemas before any row is read.
pub async fn validate_schema<S, D>(specs: &[TableSpec], source: &S, destination: &D) -> Result<()>
where
    S: TableReader + ?Sized,
    D: TableReader + ?Sized,
{
    for spec in specs {
        let source_columns = source.table_columns(&spec.source).await?;
        let destination_columns = destination.table_columns(&spec.destination).await?;
        spec.validate_columns(&source_columns, &destination_columns)?;
        debug!("{}: schema check passed", spec.destination);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str, deps: Vec<&str>) -> TableSpec {
        TableSpec::new(
            format!("legacy_{}", name),
            name,
            vec!["id"],
            vec![ColumnMapping::new("id", "id")],
        )
        .depends_on(deps)
    }

    fn hotel_plan() -> Vec<TableSpec> {
        vec![
            table("invoices", vec!["reservations", "hotels"]),
            table("reservations", vec!["hotels", "guests"]),
            table("rooms", vec!["hotels"]),
            table("hotels", vec![]),
            table("guests", vec![]),
        ]
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        let plan = MigrationPlan::new(hotel_plan()).unwrap();
        let order = plan.table_names();
        let pos = |n: &str| order.iter().position(|t| t == n).unwrap();

        for spec in plan.tables() {
            for dep in &spec.depends_on {
                assert!(pos(dep) < pos(spec.name()), "{} must precede {}", dep, spec.name());
            }
        }
    }

    #[test]
    fn test_sort_is_stable() {
        let plan = MigrationPlan::new(hotel_plan()).unwrap();
        assert_eq!(
            plan.table_names(),
            vec!["hotels", "rooms", "guests", "reservations", "invoices"]
        );
    }

    #[test]
    fn test_cycle_is_reported_with_path() {
        let specs = vec![
            table("hotels", vec![]),
            table("a", vec!["c"]),
            table("b", vec!["a"]),
            table("c", vec!["b"]),
        ];
        match MigrationPlan::new(specs) {
            Err(PlanError::CyclicDependency { cycle }) => {
                assert_eq!(cycle, vec!["a", "c", "b", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_and_self_dependency() {
        assert_eq!(
            MigrationPlan::new(vec![table("rooms", vec!["hotels"])]).unwrap_err(),
            PlanError::UnknownTable {
                table: "rooms".into(),
                dependency: "hotels".into()
            }
        );
        assert_eq!(
            MigrationPlan::new(vec![table("rooms", vec!["rooms"])]).unwrap_err(),
            PlanError::SelfDependency("rooms".into())
        );
    }

    #[test]
    fn test_duplicate_table() {
        let specs = vec![table("hotels", vec![]), table("hotels", vec![])];
        assert_eq!(
            MigrationPlan::new(specs).unwrap_err(),
            PlanError::DuplicateTable("hotels".into())
        );
    }

    #[test]
    fn test_select_pulls_transitive_dependencies() {
        let plan = MigrationPlan::new(hotel_plan()).unwrap();
        let selected: Vec<String> = plan
            .select(&["invoices".to_string()])
            .unwrap()
            .iter()
            .map(|t| t.destination.clone())
            .collect();
        assert_eq!(selected, vec!["hotels", "guests", "reservations", "invoices"]);

        let rooms = plan.select(&["rooms".to_string()]).unwrap();
        assert_eq!(rooms.len(), 2);
        assert_eq!(plan.select(&[]).unwrap().len(), 5);
    }

    #[test]
    fn test_select_unknown_table() {
        let plan = MigrationPlan::new(hotel_plan()).unwrap();
        assert_eq!(
            plan.select(&["spa".to_string()]).unwrap_err(),
            PlanError::UnknownSelection("spa".into())
        );
    }

    #[test]
    fn test_dependency_levels() {
        let plan = MigrationPlan::new(hotel_plan()).unwrap();
        let levels: Vec<Vec<String>> = dependency_levels(plan.tables())
            .into_iter()
            .map(|l| l.into_iter().map(|t| t.destination).collect())
            .collect();
        assert_eq!(
            levels,
            vec![
                vec!["hotels", "guests"],
                vec!["rooms", "reservations"],
                vec!["invoices"],
            ]
        );
    }
}
