//! The rule description registry.
//!
//! A description ties a rule-type tag to the two things the engine needs
//! from it: how to coerce raw attributes into the typed constructor
//! arguments, and how to turn a target node into a build rule (possibly
//! registering helper rules along the way - graph enhancement).

use std::collections::HashMap;
use std::sync::Arc;

use crate::attr::{CoerceError, CoercionCtx, RawAttributes};
use crate::errors::BuildError;
use crate::graph::resolver::BuildRuleResolver;
use crate::rules::args::RuleArgs;
use crate::rules::{BuildRule, BuildRuleParams, RuleType};
use crate::target_graph::TargetNode;

pub trait Description: Send + Sync {
    /// The type tag declarations use to pick this description.
    fn rule_type(&self) -> RuleType;

    /// Coerces raw parsed attributes into this kind's typed arguments.
    fn coerce(
        &self,
        ctx: &CoercionCtx<'_>,
        raw: &RawAttributes,
    ) -> Result<RuleArgs, CoerceError>;

    /// The factory: constructs the build rule for a coerced target node.
    /// May register additional helper rules with the resolver.
    fn create_build_rule(
        &self,
        params: BuildRuleParams,
        resolver: &mut BuildRuleResolver,
        node: &TargetNode,
    ) -> Result<BuildRule, BuildError>;
}

/// Maps rule-type tags to descriptions. Registering a tag twice keeps the
/// later registration.
#[derive(Default)]
pub struct DescriptionRegistry {
    descriptions: HashMap<RuleType, Arc<dyn Description>>,
}

impl DescriptionRegistry {
    pub fn new() -> DescriptionRegistry {
        DescriptionRegistry::default()
    }

    /// Registers every built-in rule kind.
    pub fn with_default_descriptions() -> DescriptionRegistry {
        use crate::rules::android::{
            AndroidBinaryDescription, AndroidBuildConfigDescription, AndroidResourceDescription,
        };
        use crate::rules::cxx::CxxLibraryDescription;
        use crate::rules::genrule::GenruleDescription;
        use crate::rules::java::{
            JavaLibraryDescription, JavaTestDescription, PrebuiltJarDescription,
        };

        let mut registry = DescriptionRegistry::new();
        registry.register(Arc::new(JavaLibraryDescription::new(RuleType::JavaLibrary)));
        registry.register(Arc::new(JavaLibraryDescription::new(RuleType::AndroidLibrary)));
        registry.register(Arc::new(JavaTestDescription));
        registry.register(Arc::new(PrebuiltJarDescription));
        registry.register(Arc::new(AndroidResourceDescription));
        registry.register(Arc::new(AndroidBuildConfigDescription));
        registry.register(Arc::new(AndroidBinaryDescription));
        registry.register(Arc::new(CxxLibraryDescription));
        registry.register(Arc::new(GenruleDescription));
        registry
    }

    pub fn register(&mut self, description: Arc<dyn Description>) {
        self.descriptions.insert(description.rule_type(), description);
    }

    pub fn get(&self, rule_type: RuleType) -> Option<Arc<dyn Description>> {
        self.descriptions.get(&rule_type).map(Arc::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_registration_wins() {
        struct First;
        struct Second;
        impl Description for First {
            fn rule_type(&self) -> RuleType {
                RuleType::Genrule
            }
            fn coerce(
                &self,
                _ctx: &CoercionCtx<'_>,
                _raw: &RawAttributes,
            ) -> Result<RuleArgs, CoerceError> {
                unimplemented!("not exercised")
            }
            fn create_build_rule(
                &self,
                _params: BuildRuleParams,
                _resolver: &mut BuildRuleResolver,
                _node: &TargetNode,
            ) -> Result<BuildRule, BuildError> {
                unimplemented!("not exercised")
            }
        }
        impl Description for Second {
            fn rule_type(&self) -> RuleType {
                RuleType::Genrule
            }
            fn coerce(
                &self,
                _ctx: &CoercionCtx<'_>,
                _raw: &RawAttributes,
            ) -> Result<RuleArgs, CoerceError> {
                unimplemented!("not exercised")
            }
            fn create_build_rule(
                &self,
                _params: BuildRuleParams,
                _resolver: &mut BuildRuleResolver,
                _node: &TargetNode,
            ) -> Result<BuildRule, BuildError> {
                unimplemented!("not exercised")
            }
        }

        let mut registry = DescriptionRegistry::new();
        let first: Arc<dyn Description> = Arc::new(First);
        let second: Arc<dyn Description> = Arc::new(Second);
        registry.register(Arc::clone(&first));
        registry.register(Arc::clone(&second));
        let resolved = registry.get(RuleType::Genrule).unwrap();
        assert!(Arc::ptr_eq(&resolved, &second));
    }

    #[test]
    fn defaults_cover_every_user_declarable_kind() {
        let registry = DescriptionRegistry::with_default_descriptions();
        for tag in &[
            "java_library",
            "java_test",
            "prebuilt_jar",
            "android_library",
            "android_resource",
            "android_build_config",
            "android_binary",
            "cxx_library",
            "genrule",
        ] {
            let rule_type = RuleType::parse(tag).unwrap();
            assert!(registry.get(rule_type).is_some(), "missing description for {}", tag);
        }
    }
}
