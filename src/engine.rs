//! Process-wide script engine state.
//!
//! The engine and its host module are built once and kept for the life of
//! the process. The user's scan module is imported lazily and cached only
//! once both the import and the entry-point lookup succeed; until then
//! every message retries it. An imported module's top-level statements run
//! exactly once, at import.

use crate::api::host_module;
use crate::config::{is_identifier, BridgeConfig};
use crate::error::BridgeError;
use crate::host::HostServices;
use crate::session::{register_header_type, SharedSession};
use rhai::module_resolvers::{FileModuleResolver, ModuleResolversCollection};
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, Module, Scope, AST};
use std::path::PathBuf;
use std::sync::Arc;

pub struct ScriptEngine {
    host_module: String,
    scan_module: String,
    scan_function: String,
    search_paths: Vec<PathBuf>,
    services: Arc<dyn HostServices>,
    session: SharedSession,
    engine: Option<Engine>,
    /// Where the imported scan module came from, once it is registered.
    module_path: Option<PathBuf>,
    init_count: usize,
}

impl ScriptEngine {
    pub fn new(config: &BridgeConfig, services: Arc<dyn HostServices>, session: SharedSession) -> Self {
        Self {
            host_module: config.host_module.clone(),
            scan_module: config.scan_module.clone(),
            scan_function: config.scan_function.clone(),
            search_paths: config.search_paths(),
            services,
            session,
            engine: None,
            module_path: None,
            init_count: 0,
        }
    }

    /// Build the engine on first use. Later calls are no-ops.
    pub fn ensure_ready(&mut self) -> Result<(), BridgeError> {
        if self.engine.is_some() {
            return Ok(());
        }

        if !is_identifier(&self.host_module) {
            return Err(BridgeError::EngineInit(format!(
                "'{}' can't be used as a module name",
                self.host_module
            )));
        }

        let mut engine = Engine::new();
        register_header_type(&mut engine);

        let module = host_module(Arc::clone(&self.services), self.session.clone());
        engine.register_static_module(self.host_module.as_str(), module.into());

        let mut resolvers = ModuleResolversCollection::new();
        for path in &self.search_paths {
            resolvers.push(FileModuleResolver::new_with_path(path));
        }
        engine.set_module_resolver(resolvers);

        engine.on_print(|text| log::info!(target: "local_scan::script", "{text}"));
        engine.on_debug(|text, source, pos| match source {
            Some(source) => log::debug!(target: "local_scan::script", "{source} @ {pos:?} | {text}"),
            None => log::debug!(target: "local_scan::script", "{pos:?} | {text}"),
        });

        self.init_count += 1;
        log::info!(
            "Script engine ready, host module registered as '{}'",
            self.host_module
        );
        self.engine = Some(engine);
        Ok(())
    }

    fn locate_module(&self) -> Option<PathBuf> {
        let file_name = format!("{}.rhai", self.scan_module);
        self.search_paths
            .iter()
            .map(|dir| dir.join(&file_name))
            .find(|candidate| candidate.is_file())
    }

    fn not_loaded(&self) -> BridgeError {
        BridgeError::ModuleImport {
            module: self.scan_module.clone(),
            reason: "module is not loaded".to_string(),
        }
    }

    /// Import the scan module and resolve its entry point, unless that has
    /// already succeeded.
    ///
    /// The module is evaluated into a self-contained `Module` that keeps its
    /// own imports and constants, then registered into the engine's global
    /// namespace so the entry point can be called without re-running the
    /// module's top level.
    pub fn ensure_user_module(&mut self) -> Result<(), BridgeError> {
        if self.module_path.is_some() {
            return Ok(());
        }
        self.ensure_ready()?;

        let import_error = |reason: String| BridgeError::ModuleImport {
            module: self.scan_module.clone(),
            reason,
        };

        let path = self.locate_module().ok_or_else(|| {
            let searched: Vec<String> = self
                .search_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            import_error(format!(
                "{}.rhai not found in [{}]",
                self.scan_module,
                searched.join(", ")
            ))
        })?;

        let Some(engine) = self.engine.as_mut() else {
            return Err(BridgeError::EngineInit("engine is not built".to_string()));
        };

        let ast = engine
            .compile_file(path.clone())
            .map_err(|e| import_error(e.to_string()))?;

        let has_entry = ast.iter_functions().any(|f| {
            f.name == self.scan_function && f.params.is_empty() && !f.access.is_private()
        });
        if !has_entry {
            return Err(BridgeError::MissingEntryPoint {
                module: self.scan_module.clone(),
                function: self.scan_function.clone(),
            });
        }

        let module = Module::eval_ast_as_new(Scope::new(), &ast, engine)
            .map_err(|e| import_error(e.to_string()))?;
        engine.register_global_module(module.into());

        log::info!("Imported scan module from {}", path.display());
        self.module_path = Some(path);
        Ok(())
    }

    /// Call the entry point with `namespace` bound as `this`.
    pub fn invoke(&mut self, namespace: &mut Dynamic) -> Result<Dynamic, BridgeError> {
        self.ensure_user_module()?;
        let Some(engine) = self.engine.as_ref() else {
            return Err(self.not_loaded());
        };

        // The entry point lives in the registered module, not in this AST.
        let options = CallFnOptions::new()
            .eval_ast(false)
            .in_all_namespaces(true)
            .bind_this_ptr(namespace);

        engine
            .call_fn_with_options::<Dynamic>(
                options,
                &mut Scope::new(),
                &AST::empty(),
                &self.scan_function,
                (),
            )
            .or_else(|err| match *err {
                EvalAltResult::Exit(value, _) => Ok(value),
                _ => Err(err),
            })
            .map_err(|e| BridgeError::ScriptRuntime {
                function: self.scan_function.clone(),
                reason: e.to_string(),
            })
    }

    pub fn scan_function(&self) -> &str {
        &self.scan_function
    }

    pub fn is_ready(&self) -> bool {
        self.engine.is_some()
    }

    pub fn module_path(&self) -> Option<&PathBuf> {
        self.module_path.as_ref()
    }

    /// How many times the engine has actually been built.
    pub fn init_count(&self) -> usize {
        self.init_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::child::{ChildError, ChildProcess};
    use rhai::{Map, INT};
    use std::fs;
    use std::path::Path;

    struct QuietHost;

    impl HostServices for QuietHost {
        fn expand_string(&self, template: &str) -> Result<String, String> {
            Ok(template.to_string())
        }
        fn log_write(&self, _selector: i32, _format: &str) {}
        fn debug_printf(&self, _format: &str) {}
        fn child_open_exim(
            &self,
            _sender: &str,
            _sender_auth: Option<&str>,
        ) -> Result<ChildProcess, ChildError> {
            Err(ChildError::Os(std::io::Error::from(std::io::ErrorKind::Unsupported)))
        }
    }

    fn engine_for(dir: &Path, config: BridgeConfig) -> ScriptEngine {
        let config = BridgeConfig {
            path_add: vec![dir.to_path_buf()],
            ..config
        };
        ScriptEngine::new(&config, Arc::new(QuietHost), SharedSession::new())
    }

    fn write_module(dir: &Path, name: &str, source: &str) {
        fs::write(dir.join(format!("{name}.rhai")), source).unwrap();
    }

    #[test]
    fn test_ensure_ready_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_for(dir.path(), BridgeConfig::default());

        for _ in 0..5 {
            engine.ensure_ready().unwrap();
        }
        assert!(engine.is_ready());
        assert_eq!(engine.init_count(), 1);
    }

    #[test]
    fn test_bad_host_module_name_fails_init_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig {
            host_module: "not a name".to_string(),
            ..Default::default()
        };
        let mut engine = engine_for(dir.path(), config);

        assert!(matches!(engine.ensure_ready(), Err(BridgeError::EngineInit(_))));
        assert!(matches!(engine.ensure_ready(), Err(BridgeError::EngineInit(_))));
        assert!(!engine.is_ready());
        assert_eq!(engine.init_count(), 0);
    }

    #[test]
    fn test_missing_module_is_import_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_for(dir.path(), BridgeConfig::default());
        let err = engine.ensure_user_module().unwrap_err();
        assert!(matches!(err, BridgeError::ModuleImport { .. }));
        assert!(err.to_string().contains("exim_local_scan.rhai not found"));
        // the engine itself stays built
        assert!(engine.is_ready());
    }

    #[test]
    fn test_syntax_error_is_import_failure() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "exim_local_scan", "fn local_scan( { 0 }");
        let mut engine = engine_for(dir.path(), BridgeConfig::default());
        assert!(matches!(
            engine.ensure_user_module(),
            Err(BridgeError::ModuleImport { .. })
        ));
    }

    #[test]
    fn test_entry_point_must_exist_without_parameters() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "exim_local_scan", "fn local_scan(x) { x }");
        let mut engine = engine_for(dir.path(), BridgeConfig::default());
        assert!(matches!(
            engine.ensure_user_module(),
            Err(BridgeError::MissingEntryPoint { .. })
        ));
        assert!(engine.module_path().is_none());

        write_module(dir.path(), "exim_local_scan", "private fn local_scan() { 0 }");
        assert!(matches!(
            engine.ensure_user_module(),
            Err(BridgeError::MissingEntryPoint { .. })
        ));
    }

    #[test]
    fn test_module_is_retried_until_it_loads() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_for(dir.path(), BridgeConfig::default());
        assert!(engine.ensure_user_module().is_err());

        write_module(dir.path(), "exim_local_scan", "fn local_scan() { 0 }");
        engine.ensure_user_module().unwrap();
        assert_eq!(
            engine.module_path(),
            Some(&dir.path().join("exim_local_scan.rhai"))
        );

        // cached: removing the file no longer matters
        fs::remove_file(dir.path().join("exim_local_scan.rhai")).unwrap();
        engine.ensure_user_module().unwrap();
        assert_eq!(engine.init_count(), 1);
    }

    #[test]
    fn test_invoke_binds_namespace_as_this() {
        let dir = tempfile::tempdir().unwrap();
        write_module(
            dir.path(),
            "filters",
            r#"
            fn check() {
                this.seen = true;
                if this.sender_address == "spam@example.com" {
                    [exim::LOCAL_SCAN_REJECT, "go away"]
                } else {
                    this.LOCAL_SCAN_ACCEPT
                }
            }
            "#,
        );
        let config = BridgeConfig {
            scan_module: "filters".to_string(),
            scan_function: "check".to_string(),
            ..Default::default()
        };
        let mut engine = engine_for(dir.path(), config);

        let mut map = Map::new();
        map.insert("sender_address".into(), Dynamic::from("spam@example.com".to_string()));
        map.insert("LOCAL_SCAN_ACCEPT".into(), Dynamic::from(0 as INT));
        let mut namespace = Dynamic::from_map(map);

        let result = engine.invoke(&mut namespace).unwrap();
        let array = result.into_array().unwrap();
        assert_eq!(array[0].as_int().unwrap(), 11);
        assert_eq!(array[1].clone().into_string().unwrap(), "go away");

        let map = namespace.try_cast::<Map>().unwrap();
        assert!(map["seen"].as_bool().unwrap());
    }

    #[test]
    fn test_imports_resolve_from_search_path() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "helpers", "fn verdict() { 13 }");
        write_module(
            dir.path(),
            "exim_local_scan",
            r#"
            import "helpers" as helpers;
            fn local_scan() { helpers::verdict() }
            "#,
        );
        let mut engine = engine_for(dir.path(), BridgeConfig::default());
        let mut namespace = Dynamic::from_map(Map::new());
        let result = engine.invoke(&mut namespace).unwrap();
        assert_eq!(result.as_int().unwrap(), 13);
    }

    #[test]
    fn test_module_imports_and_constants_outlive_import() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "helpers", "fn verdict() { 13 }");
        write_module(
            dir.path(),
            "exim_local_scan",
            r#"
            import "helpers" as helpers;
            const LIMIT = 2;
            private fn base() { helpers::verdict() }
            fn local_scan() {
                this.calls += 1;
                base() + LIMIT
            }
            "#,
        );
        let mut engine = engine_for(dir.path(), BridgeConfig::default());

        let mut map = Map::new();
        map.insert("calls".into(), Dynamic::from(0 as INT));
        let mut namespace = Dynamic::from_map(map);
        for _ in 0..3 {
            let result = engine.invoke(&mut namespace).unwrap();
            assert_eq!(result.as_int().unwrap(), 15);
        }

        let map = namespace.try_cast::<Map>().unwrap();
        assert_eq!(map["calls"].as_int().unwrap(), 3);
    }

    #[test]
    fn test_exit_value_is_the_result() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "exim_local_scan", "fn local_scan() { exit(7); 0 }");
        let mut engine = engine_for(dir.path(), BridgeConfig::default());
        let mut namespace = Dynamic::from_map(Map::new());
        assert_eq!(engine.invoke(&mut namespace).unwrap().as_int().unwrap(), 7);
    }

    #[test]
    fn test_runtime_error_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "exim_local_scan", r#"fn local_scan() { throw "boom"; }"#);
        let mut engine = engine_for(dir.path(), BridgeConfig::default());
        let mut namespace = Dynamic::from_map(Map::new());
        let err = engine.invoke(&mut namespace).unwrap_err();
        assert!(matches!(err, BridgeError::ScriptRuntime { .. }));
        assert!(err.to_string().contains("boom"));
    }
}
