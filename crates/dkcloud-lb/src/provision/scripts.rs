//! Files and commands delivered to backing instances

/// APT configuration that keeps upgrades non-interactive
pub const APT_AUTO_CONF_PATH: &str = "/etc/apt/apt.conf.d/00auto-conf";

/// Contents of [`APT_AUTO_CONF_PATH`]
pub const APT_AUTO_CONF: &str = r#"Dpkg::Options {
	"--force-confdef";
	"--force-confold";
}
"#;

/// systemd override raising the daemon's file descriptor limit
pub const HAPROXY_OVERRIDE_PATH: &str = "/etc/systemd/system/haproxy.service.d/override.conf";

/// Contents of [`HAPROXY_OVERRIDE_PATH`]
pub const HAPROXY_OVERRIDE: &str = "[Service]\nLimitNOFILE=1048576\n";

/// Where the installation script is uploaded
pub const PROVISION_SCRIPT_PATH: &str = "/tmp/clouddk_load_balancer_provisioner.sh";

/// Installs HAProxy 2.0 from the vbernat PPA
pub const PROVISION_SCRIPT: &str = r#"#!/bin/bash
set -e

export DEBIAN_FRONTEND=noninteractive

# Load the tuned kernel parameters
sysctl --system

while ps aux | grep -q [a]pt || fuser /var/lib/apt/lists/lock >/dev/null 2>&1 || fuser /var/lib/dpkg/lock >/dev/null 2>&1; do
	sleep 2
done

add-apt-repository -y ppa:vbernat/haproxy-2.0
apt-get -qq update
apt-get -qq install -y haproxy=2.0.\*
"#;

/// Process limits
pub const SECURITY_LIMITS_PATH: &str = "/etc/security/limits.conf";

/// Contents of [`SECURITY_LIMITS_PATH`]
pub const SECURITY_LIMITS: &str = "\
* soft nproc 1048576
* hard nproc 1048576
* soft nofile 1048576
* hard nofile 1048576
* soft stack 1048576
* hard stack 1048576
* soft memlock unlimited
* hard memlock unlimited
haproxy soft nproc 1048576
haproxy hard nproc 1048576
haproxy soft nofile 1048576
haproxy hard nofile 1048576
haproxy soft stack 1048576
haproxy hard stack 1048576
haproxy soft memlock unlimited
haproxy hard memlock unlimited
";

/// Kernel and network tunables
pub const SYSCTL_PATH: &str = "/etc/sysctl.d/20-maximum-performance.conf";

/// Contents of [`SYSCTL_PATH`]
pub const SYSCTL: &str = "\
fs.file-max=1048576
fs.inotify.max_user_instances=1048576
fs.inotify.max_user_watches=1048576
fs.nr_open=1048576
net.core.netdev_max_backlog=1048576
net.core.rmem_max=16777216
net.core.somaxconn=65535
net.core.wmem_max=16777216
net.ipv4.tcp_congestion_control=htcp
net.ipv4.ip_local_port_range=32768 65535
net.ipv4.tcp_fin_timeout=5
net.ipv4.tcp_max_orphans=1048576
net.ipv4.tcp_max_syn_backlog=20480
net.ipv4.tcp_max_tw_buckets=400000
net.ipv4.tcp_no_metrics_save=1
net.ipv4.tcp_rmem=4096 87380 16777216
net.ipv4.tcp_synack_retries=2
net.ipv4.tcp_syn_retries=2
net.ipv4.tcp_tw_recycle=1
net.ipv4.tcp_tw_reuse=1
net.ipv4.tcp_wmem=4096 65535 16777216
vm.max_map_count=1048576
vm.min_free_kbytes=65535
vm.overcommit_memory=1
vm.swappiness=0
vm.vfs_cache_pressure=50
";

/// Daemon configuration file
pub const HAPROXY_CONFIG_PATH: &str = "/etc/haproxy/haproxy.cfg";

/// Applies a new configuration without dropping connections
pub const RELOAD_COMMAND: &str = "systemctl reload haproxy";

/// Files uploaded before the installation script runs, in upload order
pub const BALANCER_FILES: &[(&str, &str)] = &[
    (HAPROXY_OVERRIDE_PATH, HAPROXY_OVERRIDE),
    (PROVISION_SCRIPT_PATH, PROVISION_SCRIPT),
    (SECURITY_LIMITS_PATH, SECURITY_LIMITS),
    (SYSCTL_PATH, SYSCTL),
];

/// Runs the installation script
pub fn install_command() -> String {
    format!("/bin/bash {PROVISION_SCRIPT_PATH}")
}

/// One-shot host preparation run over the password session.
///
/// Authorizes `public_key`, turns off password logins and swap, points APT
/// at the Danish mirror, then upgrades the OS and installs base packages.
pub fn host_preparation_command(public_key: &str) -> String {
    let public_key = public_key.trim().replace('\'', "");
    [
        format!("echo '{public_key}' >> ~/.ssh/authorized_keys"),
        r"sed -i 's/#\?PasswordAuthentication.*/PasswordAuthentication no/' /etc/ssh/sshd_config"
            .to_string(),
        "systemctl restart ssh".to_string(),
        "swapoff -a".to_string(),
        "sed -i '/ swap / s/^/#/' /etc/fstab".to_string(),
        "sed -i 's/us.archive.ubuntu.com/mirrors.dotsrc.org/' /etc/apt/sources.list".to_string(),
        "export DEBIAN_FRONTEND=noninteractive".to_string(),
        "while fuser /var/lib/apt/lists/lock >/dev/null 2>&1; do sleep 1; done".to_string(),
        "while fuser /var/lib/dpkg/lock >/dev/null 2>&1; do sleep 1; done".to_string(),
        "apt-get -qq update".to_string(),
        "apt-get -qq upgrade -y".to_string(),
        "apt-get -qq dist-upgrade -y".to_string(),
        "apt-get -qq install -y apt-transport-https ca-certificates software-properties-common"
            .to_string(),
    ]
    .join(" && ")
}
