//! Container creation and release on one host.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use dockfleet_id::DockerId;
use dockfleet_reconcile::{ContentHash, Lifecycle};
use tracing::{debug, info, instrument, warn};

use super::Host;
use crate::callback::{self, Callback};
use crate::container::{Container, ContainerRecord};
use crate::daemon::{image_ref, shell_quote, RunSpec};
use crate::error::{FleetError, FleetResult};
use crate::image::ImageLatch;
use crate::workload::WorkloadSpec;

/// Bound on re-resolving an image after waiting on someone else's build.
const MAX_IMAGE_ATTEMPTS: usize = 8;

/// Image a new container will run from.
#[derive(Debug)]
struct ResolvedImage {
    reference: String,
    image_id: DockerId,
    /// Held until the commit callback fires.
    latch: Option<ImageLatch>,
    /// Run the workload's install and commit.
    install: bool,
}

impl ResolvedImage {
    fn reuse(name: &str, image_id: DockerId) -> Self {
        Self {
            reference: image_ref(name),
            image_id,
            latch: None,
            install: false,
        }
    }
}

/// Counts an in-flight allocation against the container cap.
struct Reservation<'a> {
    host: &'a Host,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.host.reserved.fetch_sub(1, Ordering::SeqCst);
    }
}

fn sshd_dockerfile(base: &str) -> String {
    format!(
        "FROM {base}\n\
         RUN (apt-get update && apt-get install -y openssh-server) || yum install -y openssh-server\n\
         RUN mkdir -p /var/run/sshd && ssh-keygen -A\n\
         EXPOSE 22\n\
         CMD [\"/usr/sbin/sshd\", \"-D\"]\n"
    )
}

impl Host {
    /// Create, start, and register a container for `workload`.
    ///
    /// The container only joins the membership set once every step has
    /// succeeded. On failure the daemon-side container is removed and any
    /// build latch this call opened is released.
    #[instrument(skip(self, workload), fields(host_id = %self.id, workload = %workload.name))]
    pub async fn create_container(&self, workload: &WorkloadSpec) -> FleetResult<Arc<Container>> {
        let _allocation = self.lock.read().await;

        let lifecycle = self.lifecycle();
        if lifecycle != Lifecycle::Running {
            return Err(FleetError::ResourceUnavailable(format!(
                "host {} is {lifecycle}",
                self.id
            )));
        }

        let _reservation = self.reserve().await?;

        let image_name = workload.image_name();
        let resolved = self.resolve_image(workload, &image_name).await?;
        let run = self.assemble(workload, &resolved).await?;
        let docker_id = self.docker.run(&run).await?;

        match self
            .finish_container(workload, &image_name, resolved, &run, &docker_id)
            .await
        {
            Ok(container) => Ok(container),
            Err(e) => {
                warn!(docker_id = %docker_id, error = %e, "Container setup failed, removing");
                if let Err(rm) = self.docker.remove(&docker_id).await {
                    warn!(docker_id = %docker_id, error = %rm, "Failed to remove container");
                }
                Err(e)
            }
        }
    }

    /// Stop a container and drop it from the membership set.
    ///
    /// Releasing a container that is already stopped and gone is a no-op.
    #[instrument(skip(self, container), fields(host_id = %self.id, container_id = %container.id()))]
    pub async fn release_container(&self, container: &Container) -> FleetResult<()> {
        let _allocation = self.lock.read().await;

        let is_member = self.members.lock().await.contains_key(&container.id());
        if !is_member && container.lifecycle() == Lifecycle::Stopped {
            debug!("Container already released");
            return Ok(());
        }

        container.set_lifecycle(Lifecycle::Stopping);
        if let Err(e) = self.docker.stop(container.docker_id()).await {
            debug!(error = %e, "Stop failed, killing");
            if let Err(e) = self.docker.kill(container.docker_id()).await {
                warn!(error = %e, "Kill failed, treating container as already stopped");
            }
        }
        container.close().await;
        self.members.lock().await.remove(&container.id());

        info!(
            name = %container.name(),
            uptime_secs = container.uptime_secs(),
            "Container released"
        );
        Ok(())
    }

    /// Run script lines for a container, handing callback markers to the
    /// host first.
    pub async fn exec_commands<S: AsRef<str>>(
        &self,
        container: &Container,
        lines: &[S],
    ) -> FleetResult<()> {
        let (callbacks, rest) = callback::partition(lines);

        for line in &callbacks {
            let request = callback::parse(line)?;
            self.handle_callback(container, request).await?;
        }

        if !rest.is_empty() {
            self.docker
                .exec(container.docker_id(), &rest.join(" && "))
                .await?;
        }
        Ok(())
    }

    async fn handle_callback(&self, container: &Container, request: Callback) -> FleetResult<()> {
        let image_name = container.image_name();
        match request {
            Callback::Commit => {
                let image_id = self.docker.commit(container.docker_id(), image_name).await?;
                container.set_image_id(image_id.clone()).await;
                match container.take_pending_commit().await {
                    Some(latch) => latch.release(),
                    None => self.images.mark(image_name).await,
                }
                info!(
                    container_id = %container.id(),
                    image = %image_name,
                    image_id = %image_id,
                    "Committed container image"
                );
            }
            Callback::Push => {
                self.docker.push(image_name).await?;
                info!(image = %image_name, "Pushed image");
            }
            Callback::Unknown(verb) => {
                warn!(verb = %verb, container_id = %container.id(), "Unknown docker host callback");
            }
        }
        Ok(())
    }

    async fn reserve(&self) -> FleetResult<Reservation<'_>> {
        let members = self.members.lock().await;
        let max = self.context.config.max_containers;
        let in_flight = self.reserved.load(Ordering::SeqCst);
        if members.len() + in_flight >= max {
            return Err(FleetError::NoMachinesAvailable(format!(
                "host {} is at its limit of {max} containers",
                self.id
            )));
        }
        self.reserved.fetch_add(1, Ordering::SeqCst);
        Ok(Reservation { host: self })
    }

    fn next_container_name(&self) -> String {
        let n = self.name_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{n:02x}", self.context.config.container_name_prefix)
    }

    // =========================================================================
    // Image resolution
    // =========================================================================

    /// Find or produce the image tagged `name`.
    ///
    /// An existing tag may still be mid-install, so it is only reused once
    /// its latch is down; the ID is read again afterwards since the commit
    /// retags the name. A tag whose build was abandoned before its commit
    /// counts as absent. Without a usable tag this call claims the name's
    /// latch and produces the image. Callers that lose the claim wait on
    /// the latch and look again.
    async fn resolve_image(&self, workload: &WorkloadSpec, name: &str) -> FleetResult<ResolvedImage> {
        for _ in 0..MAX_IMAGE_ATTEMPTS {
            if let Some(tagged) = self.docker.image_id(name).await? {
                self.images.wait(name).await?;
                if !self.images.is_abandoned(name).await {
                    let image_id = self.docker.image_id(name).await?.unwrap_or(tagged);
                    debug!(image = %name, image_id = %image_id.short(), "Reusing tagged image");
                    return Ok(ResolvedImage::reuse(name, image_id));
                }
                debug!(image = %name, "Tagged image was never committed, rebuilding");
            }

            let Some(latch) = self.images.open(name).await else {
                self.images.wait(name).await?;
                continue;
            };

            // The tag may have landed between the lookup and the claim.
            if !latch.follows_abandoned() {
                if let Some(image_id) = self.docker.image_id(name).await? {
                    latch.release();
                    return Ok(ResolvedImage::reuse(name, image_id));
                }
            }

            return self.produce_image(workload, name, latch).await;
        }

        Err(FleetError::ResourceUnavailable(format!(
            "image {name} still contended after {MAX_IMAGE_ATTEMPTS} attempts"
        )))
    }

    async fn produce_image(
        &self,
        workload: &WorkloadSpec,
        name: &str,
        latch: ImageLatch,
    ) -> FleetResult<ResolvedImage> {
        let source = &workload.image;

        if let Some(base) = &source.base_image {
            return self.derive_from_base(workload, name, base, latch).await;
        }

        if source.dockerfile_url.is_some() || source.context_archive_url.is_some() {
            let dir = self.deploy_build_context(workload, name).await?;
            let image_id = self.docker.build(name, &dir).await?;
            self.docker.tag(&image_id, name).await?;
            info!(image = %name, image_id = %image_id, "Built image");
            return Ok(ResolvedImage {
                reference: image_ref(name),
                image_id,
                latch: Some(latch),
                install: true,
            });
        }

        if let Some(raw) = &source.image_id {
            let image_id = DockerId::parse(raw)?;
            self.docker.tag(&image_id, name).await?;
            info!(image = %name, image_id = %image_id, "Tagged explicit image");
            return Ok(ResolvedImage {
                reference: image_ref(name),
                image_id,
                latch: Some(latch),
                install: true,
            });
        }

        let fallback = self
            .context
            .config
            .base_image
            .clone()
            .or_else(|| source.image_name.clone());
        match fallback {
            Some(base) => self.derive_from_base(workload, name, &base, latch).await,
            None => Err(FleetError::InvalidArgument(format!(
                "workload {} names no image source",
                workload.name
            ))),
        }
    }

    /// Pull `base` and tag it as `name`, optionally layering sshd on top.
    async fn derive_from_base(
        &self,
        workload: &WorkloadSpec,
        name: &str,
        base: &str,
        latch: ImageLatch,
    ) -> FleetResult<ResolvedImage> {
        let base_id = self.docker.pull(base).await?;
        let use_ssh = workload
            .image
            .use_ssh
            .unwrap_or(self.context.config.use_ssh);

        let image_id = if use_ssh {
            let dir = format!("{}/{}-ssh", self.context.config.run_dir, name);
            let script = format!(
                "mkdir -p {dir} && printf '%s' {content} > {dir}/Dockerfile",
                dir = shell_quote(&dir),
                content = shell_quote(&sshd_dockerfile(base)),
            );
            self.docker.host_shell(&script).await?;
            self.docker.build(name, &dir).await?
        } else {
            self.docker.tag(&base_id, name).await?;
            base_id
        };

        info!(image = %name, base = %base, ssh = use_ssh, "Derived image from base");
        latch.release();
        Ok(ResolvedImage::reuse(name, image_id))
    }

    /// Download the Dockerfile and context for `name` onto the host.
    async fn deploy_build_context(&self, workload: &WorkloadSpec, name: &str) -> FleetResult<String> {
        let dir = format!("{}/{}", self.context.config.run_dir, name);
        let quoted = shell_quote(&dir);
        let mut steps = vec![format!("mkdir -p {quoted}")];

        if let Some(archive) = &workload.image.context_archive_url {
            steps.push(format!(
                "curl -fsSL {} | tar -xz -C {quoted}",
                shell_quote(archive)
            ));
        }
        if let Some(dockerfile) = &workload.image.dockerfile_url {
            steps.push(format!(
                "curl -fsSL {} -o {quoted}/Dockerfile",
                shell_quote(dockerfile)
            ));
        }

        self.docker.host_shell(&steps.join(" && ")).await?;
        Ok(dir)
    }

    // =========================================================================
    // Assembly
    // =========================================================================

    async fn assemble(&self, workload: &WorkloadSpec, image: &ResolvedImage) -> FleetResult<RunSpec> {
        let defaults = &self.context.config;

        let mut env = defaults.env.clone();
        env.extend(workload.env.clone());

        let mut volumes = defaults.volumes.clone();
        volumes.extend(workload.volumes.clone());
        for (url, container_path) in &workload.url_volumes {
            let local = self.deploy_url_volume(url).await?;
            volumes.insert(local, container_path.clone());
        }

        Ok(RunSpec {
            name: self.next_container_name(),
            image: image.reference.clone(),
            env,
            volumes,
            port_bindings: workload.port_bindings.clone(),
            exposed_ports: workload.open_port_set(),
        })
    }

    /// Deploy a URL-sourced volume onto the host, returning its local path.
    ///
    /// Archives are extracted into the directory; anything else is
    /// downloaded into it under its own file name.
    async fn deploy_url_volume(&self, url: &str) -> FleetResult<String> {
        let key = ContentHash::from_json(&serde_json::Value::from(url));
        let dir = format!("{}/volumes/{key}", self.context.config.run_dir);
        let quoted = shell_quote(&dir);

        let fetch = if url.ends_with(".tar.gz") || url.ends_with(".tgz") {
            format!("curl -fsSL {} | tar -xz -C {quoted}", shell_quote(url))
        } else {
            let file = url
                .rsplit('/')
                .next()
                .filter(|f| !f.is_empty())
                .unwrap_or("download");
            format!(
                "curl -fsSL {} -o {quoted}/{}",
                shell_quote(url),
                shell_quote(file)
            )
        };

        self.docker
            .host_shell(&format!("mkdir -p {quoted} && {fetch}"))
            .await?;
        debug!(url = %url, dir = %dir, "Deployed volume");
        Ok(dir)
    }

    // =========================================================================
    // Completion
    // =========================================================================

    async fn finish_container(
        &self,
        workload: &WorkloadSpec,
        image_name: &str,
        image: ResolvedImage,
        run: &RunSpec,
        docker_id: &DockerId,
    ) -> FleetResult<Arc<Container>> {
        let inspected = self.docker.inspect_container(docker_id.as_str()).await?;

        let mut addresses = vec![self.hostname().to_string()];
        addresses.extend(inspected.ip_address.filter(|ip| !ip.is_empty()));

        let record = ContainerRecord {
            host_id: self.id,
            name: run.name.clone(),
            docker_id: docker_id.clone(),
            image_name: image_name.to_string(),
            image_id: Some(image.image_id.clone()),
            workload_id: Some(workload.id),
            application_id: workload.application_id,
            parent_id: workload.parent_id,
            hardware_id: workload
                .hardware_id
                .clone()
                .or_else(|| self.context.config.hardware_id.clone()),
            port_bindings: run.port_bindings.clone(),
            volumes: run.volumes.clone(),
            env: run.env.clone(),
            addresses,
        };

        let install = image.install;
        let container = Arc::new(Container::new(record, image.latch));
        container.set_lifecycle(Lifecycle::Starting);

        self.open_firewall(workload).await?;

        if install {
            if let Some(command) = &workload.install_command {
                self.exec_commands(&container, &[command.as_str()]).await?;
            }
            let mut finish = vec![callback::commit()];
            if workload.push_image {
                finish.push(callback::push());
            }
            self.exec_commands(&container, &finish).await?;
        }

        {
            // `stop` drains the members under this lock, so a host that is
            // still running here will stop this container with the rest.
            let mut members = self.members.lock().await;
            let lifecycle = self.lifecycle();
            if lifecycle != Lifecycle::Running {
                return Err(FleetError::ResourceUnavailable(format!(
                    "host {} became {lifecycle} during allocation",
                    self.id
                )));
            }
            container.set_lifecycle(Lifecycle::Running);
            members.insert(container.id(), Arc::clone(&container));
        }

        info!(
            container_id = %container.id(),
            name = %run.name,
            docker_id = %docker_id.short(),
            image = %image_name,
            "Container created"
        );
        Ok(container)
    }

    async fn open_firewall(&self, workload: &WorkloadSpec) -> FleetResult<()> {
        let ports = workload.bound_host_ports();
        if ports.is_empty() {
            return Ok(());
        }

        let _firewall = self.context.firewall_lock.lock().await;
        self.context
            .firewall
            .authorize(self.hostname(), &self.docker, &ports)
            .await
    }
}
