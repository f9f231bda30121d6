pub mod agent {
    use error_chain::error_chain;

    error_chain! {
        types {
        }

        foreign_links {
            Fmt(::std::fmt::Error);
            Io(::std::io::Error) #[cfg(unix)];
            Json(::serde_json::Error);
            Yaml(::serde_yaml::Error);
            Kube(::kube::Error);
            Docker(::bollard::errors::Error);
            Template(::handlebars::RenderError);
        }

        errors {
            CommunicationError(t: String) {
                description("unable to communicate with the orchestrator")
                display("unable to communicate with the orchestrator because: '{}'", t)
            }
            ConfigError(t: String) {
                description("invalid agent configuration")
                display("invalid agent configuration: '{}'", t)
            }
            CorruptInputFile(t: String) {
                description("input config filename does not match the expected grammar")
                display("corrupt input file name: '{}'", t)
            }
        }
    }
}

pub mod keeper {
    use error_chain::error_chain;

    error_chain! {
        types {
        }

        foreign_links {
            Io(::std::io::Error) #[cfg(unix)];
            Yaml(::serde_yaml::Error);
            Template(::handlebars::RenderError);
            Notify(::notify::Error);
        }

        errors {
            ChildExited(t: String) {
                description("supervised filebeat process exited with a non-zero status")
                display("filebeat exited: {}", t)
            }
        }
    }
}
