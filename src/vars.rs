//! Layered variable resolution and `${name}` template expansion.
//!
//! Resolution consults scopes innermost-first: iteration (CSV bindings and
//! extracted values, owned by one virtual user for one loop pass), then
//! thread-group, plan and global layers, which are built once at run start
//! and shared read-only between users.

use std::collections::HashMap;
use std::sync::Arc;

use crate::plan::{TestPlan, ThreadGroup, Variable, VariableScope};

/// The shared, read-only outer layers of a group's variable stack.
#[derive(Debug, Clone, Default)]
pub struct ScopeLayers {
    global: Arc<HashMap<String, String>>,
    plan: Arc<HashMap<String, String>>,
    group: Arc<HashMap<String, String>>,
}

impl ScopeLayers {
    /// Build the outer layers for one thread group. A variable's `scope`
    /// field decides the layer it lands in, wherever it was declared; a
    /// group's own list defaults into the group layer.
    pub fn new(plan: &TestPlan, group: &ThreadGroup) -> Self {
        let mut global = HashMap::new();
        let mut plan_layer = HashMap::new();
        let mut group_layer = HashMap::new();

        for var in &plan.variables {
            layer_for(&mut global, &mut plan_layer, &mut group_layer, var);
        }
        for var in &group.variables {
            match var.scope {
                VariableScope::Global => global.insert(var.name.clone(), var.value.clone()),
                _ => group_layer.insert(var.name.clone(), var.value.clone()),
            };
        }

        Self {
            global: Arc::new(global),
            plan: Arc::new(plan_layer),
            group: Arc::new(group_layer),
        }
    }
}

fn layer_for(
    global: &mut HashMap<String, String>,
    plan: &mut HashMap<String, String>,
    group: &mut HashMap<String, String>,
    var: &Variable,
) {
    let target = match var.scope {
        VariableScope::Global => global,
        VariableScope::Plan => plan,
        VariableScope::ThreadGroup => group,
    };
    target.insert(var.name.clone(), var.value.clone());
}

/// One virtual user's view of the variable stack. The iteration layer is
/// owned here and discarded at every loop boundary.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    layers: ScopeLayers,
    iteration: HashMap<String, String>,
}

impl VariableContext {
    pub fn new(layers: ScopeLayers) -> Self {
        Self {
            layers,
            iteration: HashMap::new(),
        }
    }

    /// Replace the iteration layer with fresh bindings (start of a loop pass).
    pub fn begin_iteration(&mut self, bindings: HashMap<String, String>) {
        self.iteration = bindings;
    }

    /// Bind a value into the iteration layer, shadowing outer scopes for the
    /// rest of this loop pass.
    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.iteration.insert(name.into(), value.into());
    }

    /// Innermost-first lookup.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.iteration
            .get(name)
            .or_else(|| self.layers.group.get(name))
            .or_else(|| self.layers.plan.get(name))
            .or_else(|| self.layers.global.get(name))
            .map(String::as_str)
    }

    /// Expand every `${name}` occurrence in `template` in a single pass.
    ///
    /// Undefined names leave the placeholder literal so the failure is
    /// visible downstream. `$${name}` escapes to a literal `${name}`, and an
    /// unterminated `${` is copied through unchanged. Values are substituted
    /// as-is; there is no numeric coercion.
    pub fn expand(&self, template: &str) -> String {
        if !template.contains('$') {
            return template.to_string();
        }

        let mut out = String::with_capacity(template.len());
        let bytes = template.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'$' && bytes[i + 1..].starts_with(b"${") {
                // Escaped placeholder: emit it literally, without resolving.
                match find_close(bytes, i + 2) {
                    Some(end) => {
                        out.push_str(&template[i + 1..=end]);
                        i = end + 1;
                    }
                    None => {
                        out.push_str(&template[i..]);
                        break;
                    }
                }
            } else if bytes[i..].starts_with(b"${") {
                match find_close(bytes, i + 1) {
                    Some(end) => {
                        let name = &template[i + 2..end];
                        match self.resolve(name) {
                            Some(value) => out.push_str(value),
                            None => out.push_str(&template[i..=end]),
                        }
                        i = end + 1;
                    }
                    None => {
                        out.push_str(&template[i..]);
                        break;
                    }
                }
            } else {
                let ch = template[i..].chars().next().unwrap();
                out.push(ch);
                i += ch.len_utf8();
            }
        }
        out
    }
}

// Position of the first '}' at or after `open`.
fn find_close(bytes: &[u8], open: usize) -> Option<usize> {
    bytes[open..]
        .iter()
        .position(|&b| b == b'}')
        .map(|p| open + p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn var(name: &str, value: &str, scope: VariableScope) -> Variable {
        Variable {
            id: Uuid::new_v4(),
            name: name.into(),
            value: value.into(),
            scope,
        }
    }

    fn context(pairs: &[(&str, &str)]) -> VariableContext {
        let mut ctx = VariableContext::default();
        for (k, v) in pairs {
            ctx.bind(*k, *v);
        }
        ctx
    }

    #[test]
    fn simple_substitution() {
        let ctx = context(&[("host", "example.com"), ("v", "v2")]);
        assert_eq!(
            ctx.expand("http://${host}/api/${v}/users"),
            "http://example.com/api/v2/users"
        );
    }

    #[test]
    fn undefined_name_stays_literal() {
        let ctx = context(&[]);
        assert_eq!(ctx.expand("x/${missing}/y"), "x/${missing}/y");
    }

    #[test]
    fn escape_produces_literal_placeholder() {
        let ctx = context(&[("a", "1")]);
        assert_eq!(ctx.expand("$${a}"), "${a}");
        assert_eq!(ctx.expand("${a}-$${a}"), "1-${a}");
    }

    #[test]
    fn unterminated_placeholder_is_copied() {
        let ctx = context(&[("a", "1")]);
        assert_eq!(ctx.expand("x${a"), "x${a");
        assert_eq!(ctx.expand("x$${a"), "x$${a");
    }

    #[test]
    fn lone_dollar_signs_pass_through() {
        let ctx = context(&[]);
        assert_eq!(ctx.expand("cost: $5 $$"), "cost: $5 $$");
    }

    #[test]
    fn empty_name_resolves_or_stays() {
        let ctx = context(&[]);
        assert_eq!(ctx.expand("${}"), "${}");
    }

    #[test]
    fn expansion_is_idempotent_without_placeholder_values() {
        let ctx = context(&[("a", "plain"), ("b", "also plain")]);
        for template in ["${a}/${b}", "no vars", "${missing}", "$${a}"] {
            let once = ctx.expand(template);
            // Idempotence holds as long as no value itself contains "${".
            if !once.contains("${") {
                assert_eq!(ctx.expand(&once), once);
            }
        }
    }

    #[test]
    fn scope_order_is_iteration_group_plan_global() {
        let mut plan = TestPlan::new("p");
        plan.variables = vec![
            var("name", "from-global", VariableScope::Global),
            var("name", "from-plan", VariableScope::Plan),
        ];
        let group = ThreadGroup {
            id: Uuid::new_v4(),
            name: "g".into(),
            num_threads: 1,
            ramp_up_seconds: 0,
            loop_count: Default::default(),
            requests: Vec::new(),
            variables: vec![var("name", "from-group", VariableScope::ThreadGroup)],
            enabled: true,
        };

        let layers = ScopeLayers::new(&plan, &group);
        let mut ctx = VariableContext::new(layers);
        assert_eq!(ctx.resolve("name"), Some("from-group"));

        ctx.bind("name", "from-iteration");
        assert_eq!(ctx.resolve("name"), Some("from-iteration"));

        ctx.begin_iteration(HashMap::new());
        assert_eq!(ctx.resolve("name"), Some("from-group"));
    }

    #[test]
    fn plan_and_global_layers_fall_through() {
        let mut plan = TestPlan::new("p");
        plan.variables = vec![
            var("g", "global-value", VariableScope::Global),
            var("p", "plan-value", VariableScope::Plan),
        ];
        let group = ThreadGroup {
            id: Uuid::new_v4(),
            name: "g".into(),
            num_threads: 1,
            ramp_up_seconds: 0,
            loop_count: Default::default(),
            requests: Vec::new(),
            variables: Vec::new(),
            enabled: true,
        };
        let ctx = VariableContext::new(ScopeLayers::new(&plan, &group));
        assert_eq!(ctx.resolve("g"), Some("global-value"));
        assert_eq!(ctx.resolve("p"), Some("plan-value"));
        assert_eq!(ctx.resolve("absent"), None);
    }

    #[test]
    fn iteration_reset_discards_bindings() {
        let mut ctx = VariableContext::default();
        ctx.begin_iteration(HashMap::from([("user".to_string(), "alice".to_string())]));
        assert_eq!(ctx.resolve("user"), Some("alice"));
        ctx.begin_iteration(HashMap::new());
        assert_eq!(ctx.resolve("user"), None);
    }

    #[test]
    fn values_are_never_coerced() {
        let ctx = context(&[("n", "007")]);
        assert_eq!(ctx.expand("id=${n}"), "id=007");
    }
}
