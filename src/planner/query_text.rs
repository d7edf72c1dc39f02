use std::{collections::BTreeSet, fmt::Display};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{database::NodeId, planner::{PlannerError, PlannerResult}};

static TEMPLATE_SLOT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&xp(\d+)xp&|&xnodecount&|&xnodeid&|&xsubq(\d+)&").expect("slot pattern is valid")
});

/// One piece of a statement template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fragment {
    Text(String),
    /// 1-based prepared-statement parameter.
    Param(usize),
    /// Number of nodes that produced rows for an outer-join branch.
    NodeCount,
    /// Id of the node executing the statement.
    NodeId,
    /// Value produced by the scalar subplan with this placeholder number.
    SubqueryResult(usize),
}

/// Values for the non-text fragments of a [`QueryText`].
#[derive(Debug, Clone, Default)]
pub struct Bindings<'a> {
    /// SQL literal text per parameter, index 0 holds parameter 1.
    pub params: Option<&'a [String]>,
    pub node_count: Option<usize>,
    pub node_id: Option<NodeId>,
    pub subquery_results: Option<&'a [(usize, String)]>,
}

/// Statement text with typed slots instead of embedded placeholder strings.
///
/// Rendering is structural: binding a slot never searches the text, and a slot
/// without a value is an error rather than residual placeholder syntax.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QueryText {
    fragments: Vec<Fragment>,
}

impl QueryText {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.iter().all(|f| matches!(f, Fragment::Text(t) if t.is_empty()))
    }

    pub fn push_str(&mut self, text: &str) -> &mut Self {
        if text.is_empty() {
            return self;
        }
        match self.fragments.last_mut() {
            Some(Fragment::Text(last)) => last.push_str(text),
            _ => self.fragments.push(Fragment::Text(text.to_string())),
        }
        self
    }

    pub fn push_fragment(&mut self, fragment: Fragment) -> &mut Self {
        match fragment {
            Fragment::Text(t) => self.push_str(&t),
            other => {
                self.fragments.push(other);
                self
            }
        }
    }

    pub fn push_param(&mut self, index: usize) -> &mut Self {
        self.push_fragment(Fragment::Param(index))
    }

    pub fn push_node_count(&mut self) -> &mut Self {
        self.push_fragment(Fragment::NodeCount)
    }

    pub fn push_node_id(&mut self) -> &mut Self {
        self.push_fragment(Fragment::NodeId)
    }

    pub fn append(&mut self, other: &QueryText) -> &mut Self {
        for f in &other.fragments {
            self.push_fragment(f.clone());
        }
        self
    }

    /// Join several texts with a literal separator.
    pub fn join(parts: &[QueryText], separator: &str) -> QueryText {
        let mut out = QueryText::new();
        for (i, p) in parts.iter().enumerate() {
            if i > 0 {
                out.push_str(separator);
            }
            out.append(p);
        }
        out
    }

    /// Parameter numbers referenced anywhere in the text.
    pub fn params(&self) -> BTreeSet<usize> {
        self.fragments
            .iter()
            .filter_map(|f| match f {
                Fragment::Param(n) => Some(*n),
                _ => None,
            })
            .collect()
    }

    pub fn has_node_count(&self) -> bool {
        self.fragments.iter().any(|f| matches!(f, Fragment::NodeCount))
    }

    pub fn has_node_id(&self) -> bool {
        self.fragments.iter().any(|f| matches!(f, Fragment::NodeId))
    }

    /// Fix the node-count slot to a known value.
    pub fn substitute_node_count(&mut self, count: usize) {
        let fragments = std::mem::take(&mut self.fragments);
        for f in fragments {
            match f {
                Fragment::NodeCount => self.push_str(&count.to_string()),
                other => self.push_fragment(other),
            };
        }
    }

    /// Copy with every parameter slot replaced by its literal; other slots stay.
    pub fn bind_params(&self, params: &[String]) -> PlannerResult<QueryText> {
        let mut out = QueryText::new();
        for f in &self.fragments {
            match f {
                Fragment::Param(n) => {
                    let value = n
                        .checked_sub(1)
                        .and_then(|i| params.get(i))
                        .ok_or(PlannerError::ParameterOutOfRange { index: *n, supplied: params.len() })?;
                    out.push_str(value);
                }
                other => {
                    out.push_fragment(other.clone());
                }
            }
        }
        Ok(out)
    }

    /// Rename `table.old` references to `table.new` inside text fragments.
    pub fn rename_column(&mut self, table: &str, old: &str, new: &str) {
        let pattern = format!(r"\b{}\.{}\b", regex::escape(table), regex::escape(old));
        let Ok(re) = Regex::new(&pattern) else { return };
        let replacement = format!("{table}.{new}");
        for f in &mut self.fragments {
            if let Fragment::Text(t) = f {
                if re.is_match(t) {
                    *t = re.replace_all(t, regex::NoExpand(&replacement)).into_owned();
                }
            }
        }
    }

    /// Text with every slot bound.
    pub fn render(&self, bindings: &Bindings) -> PlannerResult<String> {
        let mut out = String::new();
        for f in &self.fragments {
            match f {
                Fragment::Text(t) => out.push_str(t),
                Fragment::Param(n) => {
                    let params = bindings.params.ok_or(PlannerError::UnboundParameter(*n))?;
                    let value = n
                        .checked_sub(1)
                        .and_then(|i| params.get(i))
                        .ok_or(PlannerError::ParameterOutOfRange { index: *n, supplied: params.len() })?;
                    out.push_str(value);
                }
                Fragment::NodeCount => {
                    let n = bindings.node_count.ok_or(PlannerError::UnboundNodeCount)?;
                    out.push_str(&n.to_string());
                }
                Fragment::NodeId => {
                    let id = bindings.node_id.ok_or(PlannerError::UnboundNodeId)?;
                    out.push_str(&id.to_string());
                }
                Fragment::SubqueryResult(n) => {
                    let value = bindings
                        .subquery_results
                        .and_then(|r| r.iter().find(|(k, _)| k == n))
                        .map(|(_, v)| v.as_str())
                        .ok_or_else(|| PlannerError::InvalidTemplate(format!("scalar subquery {n} has no result")))?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }

    /// Parse the `&xp<N>xp&` / `&xnodecount&` / `&xnodeid&` / `&xsubq<N>&` template syntax.
    pub fn parse_template(template: &str) -> PlannerResult<QueryText> {
        let mut out = QueryText::new();
        let mut last = 0;
        for caps in TEMPLATE_SLOT.captures_iter(template) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&template[last..whole.start()]);
            let fragment = if let Some(n) = caps.get(1) {
                Fragment::Param(Self::slot_number(n.as_str())?)
            } else if let Some(n) = caps.get(2) {
                Fragment::SubqueryResult(Self::slot_number(n.as_str())?)
            } else if whole.as_str() == "&xnodecount&" {
                Fragment::NodeCount
            } else {
                Fragment::NodeId
            };
            out.push_fragment(fragment);
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Ok(out)
    }

    fn slot_number(s: &str) -> PlannerResult<usize> {
        match s.parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(PlannerError::InvalidTemplate(format!("bad slot number '{s}'"))),
        }
    }
}

impl From<&str> for QueryText {
    fn from(value: &str) -> Self {
        let mut q = QueryText::new();
        q.push_str(value);
        q
    }
}

impl From<String> for QueryText {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl Display for QueryText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for frag in &self.fragments {
            match frag {
                Fragment::Text(t) => f.write_str(t)?,
                Fragment::Param(n) => write!(f, "&xp{n}xp&")?,
                Fragment::NodeCount => f.write_str("&xnodecount&")?,
                Fragment::NodeId => f.write_str("&xnodeid&")?,
                Fragment::SubqueryResult(n) => write!(f, "&xsubq{n}&")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_then_display_keeps_legacy_syntax() {
        let t = "SELECT a FROM t WHERE b = &xp1xp& AND c < &xp12xp& LIMIT &xnodecount&";
        let q = QueryText::parse_template(t).unwrap();
        assert_eq!(q.to_string(), t);
        assert_eq!(q.params().into_iter().collect::<Vec<_>>(), vec![1, 12]);
        assert!(q.has_node_count());
    }

    #[test]
    fn adjacent_text_is_merged() {
        let mut q = QueryText::from("SELECT ");
        q.push_str("1");
        q.push_param(1).push_str(" x").push_str(" y");
        assert_eq!(q.fragments().len(), 3);
    }

    #[test]
    fn render_binds_every_slot() {
        let q = QueryText::parse_template("SELECT &xnodeid&, &xnodecount& WHERE a = &xp2xp& AND b = &xsubq1&").unwrap();
        let params = vec!["'x'".to_string(), "7".to_string()];
        let subq = vec![(1usize, "99".to_string())];
        let text = q
            .render(&Bindings { params: Some(&params), node_count: Some(3), node_id: Some(4), subquery_results: Some(&subq) })
            .unwrap();
        assert_eq!(text, "SELECT 4, 3 WHERE a = 7 AND b = 99");
    }

    #[test]
    fn missing_binding_is_an_error_not_residual_text() {
        let q = QueryText::parse_template("a = &xp3xp&").unwrap();
        let params = vec!["1".to_string()];
        assert_eq!(
            q.render(&Bindings { params: Some(&params), ..Default::default() }),
            Err(PlannerError::ParameterOutOfRange { index: 3, supplied: 1 })
        );
        assert_eq!(q.render(&Bindings::default()), Err(PlannerError::UnboundParameter(3)));
    }

    #[test]
    fn binding_params_keeps_node_slots() {
        let q = QueryText::parse_template("SELECT &xnodeid& WHERE a = &xp1xp&").unwrap();
        let bound = q.bind_params(&["'x'".to_string()]).unwrap();
        assert_eq!(bound.to_string(), "SELECT &xnodeid& WHERE a = 'x'");
        assert!(bound.params().is_empty());
        assert!(q.bind_params(&[]).is_err());
    }

    #[test]
    fn zero_parameter_number_is_rejected() {
        assert!(QueryText::parse_template("a = &xp0xp&").is_err());
    }

    #[test]
    fn node_count_substitution_is_structural() {
        let mut q = QueryText::parse_template("SELECT &xnodecount& + 1").unwrap();
        q.substitute_node_count(4);
        assert!(!q.has_node_count());
        assert_eq!(q.render(&Bindings::default()).unwrap(), "SELECT 4 + 1");
        assert_eq!(q.fragments().len(), 1);
    }

    #[test]
    fn rename_column_respects_word_boundaries() {
        let mut q = QueryText::from("TMP1.a + TMP1.ab + TMP10.a");
        q.rename_column("TMP1", "a", "EXPRESSION_1_1");
        assert_eq!(q.to_string(), "TMP1.EXPRESSION_1_1 + TMP1.ab + TMP10.a");
    }
}
