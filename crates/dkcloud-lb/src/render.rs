//! HAProxy configuration rendering
//!
//! [`render`] is a pure function of the resolved options, the port bindings
//! and the backend addresses. The output is always the full file; it is
//! never diffed against what is currently deployed.
//!
//! Layout: a `global` block sized by the capacity tier, a `defaults` block
//! from the options, then one `listen` block per port binding. Directives
//! are tab-indented, blocks are separated by a single blank line and the
//! text ends with one newline.

use crate::options::{ConfigurationOptions, Protocol, StickySessions};
use crate::types::{CapacityTier, PortBinding, TargetEndpoint};

const SSL_BIND_CIPHERS: &str = "ECDH+AESGCM:DH+AESGCM:ECDH+AES256:DH+AES256:ECDH+AES128:DH+AES:RSA+AESGCM:RSA+AES:!aNULL:!MD5:!DSS";

/// Render the complete configuration file
pub fn render(options: &ConfigurationOptions, ports: &[PortBinding], backends: &[String]) -> String {
    let tier = CapacityTier::for_connection_limit(options.connection_limit);
    let per_process = options.connection_limit / tier.cores();

    let mut blocks = vec![global_block(tier), defaults_block(options, per_process)];
    blocks.extend(
        ports
            .iter()
            .map(|port| listen_block(options, port, backends, per_process)),
    );

    let mut text = blocks
        .iter()
        .map(|lines| lines.join("\n"))
        .collect::<Vec<_>>()
        .join("\n\n");
    text.push('\n');
    text
}

fn directive(text: impl AsRef<str>) -> String {
    format!("\t{}", text.as_ref())
}

fn global_block(tier: CapacityTier) -> Vec<String> {
    let mut lines = vec![
        "global".to_string(),
        directive("log /dev/log local0 info alert"),
        directive("log /dev/log local1 notice alert"),
        directive("chroot /var/lib/haproxy"),
        directive("stats socket /run/haproxy/admin.sock mode 660 level admin expose-fd listeners"),
        directive("stats timeout 30s"),
        directive("user haproxy"),
        directive("group haproxy"),
        directive("ca-base /etc/ssl/certs"),
        directive("crt-base /etc/ssl/private"),
        directive(format!("ssl-default-bind-ciphers {SSL_BIND_CIPHERS}")),
        directive("ssl-default-bind-options no-sslv3"),
        directive(format!("nbproc {}", tier.cores())),
        directive("nbthread 2"),
    ];
    lines.extend((1..=tier.cores()).map(|cpu| directive(format!("cpu-map {cpu} {cpu}"))));
    lines
}

fn defaults_block(options: &ConfigurationOptions, per_process: u32) -> Vec<String> {
    let mode = match options.protocol {
        Protocol::Http => "http",
        Protocol::Tcp | Protocol::Https => "tcp",
    };
    vec![
        "defaults".to_string(),
        directive(format!("balance {}", options.algorithm)),
        directive("log global"),
        directive(format!("maxconn {per_process}")),
        directive(format!("mode {mode}")),
        directive(format!("timeout check {}s", options.health_check_timeout)),
        directive(format!("timeout client {}s", options.client_timeout)),
        directive("timeout connect 5s"),
        directive(format!("timeout server {}s", options.server_timeout)),
    ]
}

fn listen_block(
    options: &ConfigurationOptions,
    port: &PortBinding,
    backends: &[String],
    per_process: u32,
) -> Vec<String> {
    let mut lines = vec![
        format!("listen {}", port.listen_port),
        directive(format!("bind 0.0.0.0:{}", port.listen_port)),
        directive(match options.health_check_protocol {
            Protocol::Tcp => "option tcp-check".to_string(),
            Protocol::Http => format!("option httpchk GET {}", options.health_check_path),
            Protocol::Https => "option ssl-hello-chk".to_string(),
        }),
    ];

    match options.sticky_sessions {
        StickySessions::None => {}
        StickySessions::SourceIp => {
            lines.push(directive("stick-table type ip size 1m expire 30m"));
            lines.push(directive("stick on src"));
        }
        StickySessions::Cookie => {
            lines.push(directive(format!(
                "cookie {} insert indirect nocache",
                options.sticky_cookie_name
            )));
        }
    }

    lines.extend(
        port.targets(backends)
            .map(|target| server_line(options, &target, per_process)),
    );
    lines
}

fn server_line(options: &ConfigurationOptions, target: &TargetEndpoint, per_process: u32) -> String {
    let mut line = format!(
        "server {target} {target} maxconn {per_process} check inter {}s fall {} rise {}",
        options.health_check_interval, options.unhealthy_threshold, options.healthy_threshold
    );
    if options.sticky_sessions == StickySessions::Cookie {
        line.push_str(&format!(" cookie {}", target.address));
    }
    if options.proxy_protocol {
        line.push_str(" send-proxy");
    }
    directive(line)
}
