//! kiln is a polyglot, target-graph-based incremental build engine.
//!
//! Build files declare named rules with typed attributes; kiln expands
//! them into an action graph and executes the minimal set of actions
//! needed to produce the requested outputs, reusing prior results
//! whenever inputs have not changed.

use std::env;

/// The main entry point. Parses CLI arguments and runs one build command.
pub fn main() {
    let exit_code = main_inner();
    std::process::exit(exit_code);
}

fn main_inner() -> i32 {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    if let Some(first_arg) = args.first() {
        match first_arg.as_str() {
            "--version" | "-V" => {
                println!("kiln {}", kiln::version());
                return 0;
            }
            "--help" | "-h" => {
                println!("{}", help());
                return 0;
            }
            _ => {}
        }
    }

    let project_root = match env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("cannot determine the working directory: {}", e);
            return 1;
        }
    };

    kiln::cmd::run(&project_root, &args)
}

fn help() -> &'static str {
    r#"usage: kiln <command> [args...]

    build <target>...       build targets and their dependencies
    test <target>...        build and run test rules
    run <target>            build a target and execute its output
    install <apk_target>    build and install an APK via adb
    uninstall <apk_target>  uninstall an APK's package via adb
    targets [options]       list known targets
    audit deps|classpath <target>
    cache [--fetch|--store] <rulekey>
    clean                   delete all build outputs
    project [--ide intellij|xcode]
    quickstart

    --version or -V to print the version
    --help or -h for this message
    "#
}
