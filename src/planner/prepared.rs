use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::{
    database::{Catalog, ExpressionType, SysTable},
    planner::{ExecutionStep, PlanId, PlanTree, PlannerError, PlannerResult, StepDetail},
};

static NUMERIC_LITERAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+)?$").expect("numeric pattern is valid")
});

/// Which side of a step a statement lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepSide {
    Node,
    Coordinator,
}

/// A statement holding parameter slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSite {
    pub plan: PlanId,
    pub step: usize,
    pub side: StepSide,
}

#[derive(Debug, Clone)]
struct PartitionRoute {
    plan: PlanId,
    step: usize,
    parameter: usize,
    table: Arc<SysTable>,
    /// Producer sides as compiled, restored by [`PreparedHandler::reset`].
    compiled_node: StepDetail,
    compiled_coord: Option<StepDetail>,
}

/// Binds prepared-statement values into a compiled plan, repeatedly and
/// without recompiling.
///
/// Every call renders from the statements as compiled, so a second set of
/// values fully replaces the first.
#[derive(Debug, Clone)]
pub struct PreparedHandler {
    parameter_types: Vec<ExpressionType>,
    sites: Vec<ParameterSite>,
    routes: Vec<PartitionRoute>,
    highest_parameter: usize,
}

impl PreparedHandler {
    /// Record every statement holding parameters and every step whose
    /// producers follow a parameter bound to a partitioned column.
    pub fn prepare_parameters(
        tree: &mut PlanTree,
        catalog: &dyn Catalog,
        parameter_types: &[ExpressionType],
    ) -> PlannerResult<Self> {
        let mut sites = Vec::new();
        let mut routes = Vec::new();
        let mut highest_parameter = 0;
        let plan_ids: Vec<PlanId> = tree.plans().iter().map(|p| p.id).collect();

        for plan in plan_ids {
            let mut index = 0;
            while let Some(step) = tree.step_mut(plan, index) {
                for (side, detail) in sides_mut(step) {
                    let params = detail.query.params();
                    let Some(&max) = params.last() else { continue };
                    if max > parameter_types.len() {
                        return Err(PlannerError::ParameterOutOfRange { index: max, supplied: parameter_types.len() });
                    }
                    highest_parameter = highest_parameter.max(max);
                    if detail.template.is_none() {
                        detail.template = Some(detail.query.clone());
                    }
                    sites.push(ParameterSite { plan, step: index, side });
                }
                if let Some((table, parameter)) = step.partition_parameter.clone() {
                    let table = catalog.table(&table).ok_or(PlannerError::UnknownTable(table))?;
                    if parameter == 0 {
                        return Err(PlannerError::InvalidTemplate("partition parameter numbers start at 1".into()));
                    }
                    if parameter > parameter_types.len() {
                        return Err(PlannerError::ParameterOutOfRange { index: parameter, supplied: parameter_types.len() });
                    }
                    routes.push(PartitionRoute {
                        plan,
                        step: index,
                        parameter,
                        table,
                        compiled_node: step.node_detail.clone(),
                        compiled_coord: step.coord_detail.clone(),
                    });
                }
                index += 1;
            }
        }
        debug!(sites = sites.len(), routes = routes.len(), "prepared parameters");
        Ok(Self { parameter_types: parameter_types.to_vec(), sites, routes, highest_parameter })
    }

    pub fn sites(&self) -> &[ParameterSite] {
        &self.sites
    }

    /// SQL literal for one bound value.
    pub fn literal(&self, index: usize, value: Option<&str>) -> String {
        let Some(value) = value else {
            return "NULL".to_string();
        };
        let numeric = self.parameter_types.get(index).is_some_and(ExpressionType::is_numeric);
        if numeric && NUMERIC_LITERAL.is_match(value.trim()) {
            value.trim().to_string()
        } else {
            format!("'{}'", value.replace('\'', "''"))
        }
    }

    /// Bind `values` (index 0 is parameter 1, `None` is NULL) into every
    /// recorded statement and reroute partition-bound steps.
    ///
    /// Fails without touching the plan when a referenced parameter has no value.
    pub fn substitute_parameter_values(&self, tree: &mut PlanTree, values: &[Option<String>]) -> PlannerResult<()> {
        if self.highest_parameter > values.len() {
            return Err(PlannerError::ParameterOutOfRange { index: self.highest_parameter, supplied: values.len() });
        }
        if let Some(route) = self.routes.iter().find(|r| r.parameter > values.len()) {
            return Err(PlannerError::ParameterOutOfRange { index: route.parameter, supplied: values.len() });
        }
        let literals: Vec<String> =
            values.iter().enumerate().map(|(i, v)| self.literal(i, v.as_deref())).collect();

        let mut bound = Vec::with_capacity(self.sites.len());
        for site in &self.sites {
            let step = tree.step_mut(site.plan, site.step).ok_or(PlannerError::EmptyPlan)?;
            let detail = side_mut(step, site.side).ok_or(PlannerError::EmptyPlan)?;
            let template = detail.template.as_ref().unwrap_or(&detail.query);
            bound.push(template.bind_params(&literals)?);
        }
        for (site, query) in self.sites.iter().zip(bound) {
            if let Some(detail) = tree.step_mut(site.plan, site.step).and_then(|s| side_mut(s, site.side)) {
                detail.query = query;
            }
        }

        let coordinator = tree.coordinator();
        for route in &self.routes {
            let value = values[route.parameter - 1].as_deref();
            let normalized = match (value, route.table.partitioned_column_type()) {
                (Some(v), Some(ty)) => Some(ty.normalize_value(v)),
                (v, _) => v.map(str::to_string),
            };
            let nodes = route.table.partition_map.get_partitions(normalized.as_deref());
            debug!(table = %route.table.name, parameter = route.parameter, ?nodes, "rerouted by parameter");
            if let Some(step) = tree.step_mut(route.plan, route.step) {
                step.run_on_nodes(&nodes, coordinator);
            }
        }
        Ok(())
    }

    /// Put every recorded statement, and every rerouted step's producers,
    /// back to their compiled form.
    pub fn reset(&self, tree: &mut PlanTree) {
        let coordinator = tree.coordinator();
        for route in &self.routes {
            if let Some(step) = tree.step_mut(route.plan, route.step) {
                step.node_detail = route.compiled_node.clone();
                step.coord_detail = route.compiled_coord.clone();
                step.refresh_node_usage(coordinator);
            }
        }
        for site in &self.sites {
            if let Some(detail) = tree.step_mut(site.plan, site.step).and_then(|s| side_mut(s, site.side)) {
                if let Some(template) = &detail.template {
                    detail.query = template.clone();
                }
            }
        }
    }
}

fn sides_mut(step: &mut ExecutionStep) -> Vec<(StepSide, &mut StepDetail)> {
    let mut sides = vec![(StepSide::Node, &mut step.node_detail)];
    if let Some(c) = step.coord_detail.as_mut() {
        sides.push((StepSide::Coordinator, c));
    }
    sides
}

fn side_mut(step: &mut ExecutionStep, side: StepSide) -> Option<&mut StepDetail> {
    match side {
        StepSide::Node => Some(&mut step.node_detail),
        StepSide::Coordinator => step.coord_detail.as_mut(),
    }
}
