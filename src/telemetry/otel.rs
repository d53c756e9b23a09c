//! OTel resource construction and provider assembly.
//!
//! Adapted from `examples/unikmhz-uxum/src/telemetry.rs`'s
//! `otel_resource()`: the same resource-detector stack, reduced to the
//! static attributes this crate actually wants (`service.name`,
//! `service.version`), plus meter/tracer provider builders driven by
//! `telemetry.openTelemetry.exporters` (spec §4.1/§6.1).

use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::{MetricExporter, SpanExporter, WithExportConfig};
use opentelemetry_resource_detectors::{
    OsResourceDetector, ProcessResourceDetector,
};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    resource::{EnvResourceDetector, ResourceDetector, SdkProvidedResourceDetector, TelemetryResourceDetector},
    trace::SdkTracerProvider,
    Resource,
};

use crate::config::ExporterKind;
use crate::errors::TelemetryError;

/// Build the process-wide OTel [`Resource`], combining platform, process,
/// SDK, environment and static attributes.
pub fn build_resource(service_version: &str) -> Resource {
    Resource::builder()
        .with_detector(Box::new(OsResourceDetector))
        .with_detector(Box::new(ProcessResourceDetector))
        .with_detector(Box::new(SdkProvidedResourceDetector))
        .with_detector(Box::new(EnvResourceDetector::new()))
        .with_detector(Box::new(TelemetryResourceDetector))
        .with_attributes([
            KeyValue::new("service.name", "bunnysidecar"),
            KeyValue::new("service.version", service_version.to_string()),
        ])
        .build()
}

/// Build the meter provider from the configured exporter list, plus the
/// Prometheus exporter if `prometheus` is one of them (the registry it
/// feeds is owned by [`super::TelemetryPlane`], not this function).
pub fn build_meter_provider(
    resource: &Resource,
    exporters: &[ExporterKind],
    registry: &prometheus::Registry,
) -> Result<SdkMeterProvider, TelemetryError> {
    let mut builder = SdkMeterProvider::builder().with_resource(resource.clone());
    for kind in exporters {
        match kind {
            ExporterKind::StdoutMetric => {
                let exporter = opentelemetry_stdout::MetricExporter::default();
                builder = builder.with_reader(PeriodicReader::builder(exporter).build());
            }
            ExporterKind::OtlpMetricHttp => {
                let exporter = MetricExporter::builder()
                    .with_http()
                    .build()
                    .map_err(|e| TelemetryError::Exporter(e.to_string()))?;
                builder = builder.with_reader(PeriodicReader::builder(exporter).build());
            }
            ExporterKind::OtlpMetricGrpc => {
                let exporter = MetricExporter::builder()
                    .with_tonic()
                    .build()
                    .map_err(|e| TelemetryError::Exporter(e.to_string()))?;
                builder = builder.with_reader(PeriodicReader::builder(exporter).build());
            }
            ExporterKind::Prometheus => {
                let reader = opentelemetry_prometheus_text_exporter::exporter()
                    .with_registry(registry.clone())
                    .build()
                    .map_err(|e| TelemetryError::Exporter(e.to_string()))?;
                builder = builder.with_reader(reader);
            }
            ExporterKind::StdoutTrace | ExporterKind::OtlpTraceHttp | ExporterKind::OtlpTraceGrpc => {}
        }
    }
    let provider = builder.build();
    global::set_meter_provider(provider.clone());
    Ok(provider)
}

/// Build the tracer provider from the configured exporter list.
pub fn build_tracer_provider(
    resource: &Resource,
    exporters: &[ExporterKind],
) -> Result<SdkTracerProvider, TelemetryError> {
    let mut builder = SdkTracerProvider::builder().with_resource(resource.clone());
    for kind in exporters {
        match kind {
            ExporterKind::StdoutTrace => {
                let exporter = opentelemetry_stdout::SpanExporter::default();
                builder = builder.with_simple_exporter(exporter);
            }
            ExporterKind::OtlpTraceHttp => {
                let exporter = SpanExporter::builder()
                    .with_http()
                    .build()
                    .map_err(|e| TelemetryError::Exporter(e.to_string()))?;
                builder = builder.with_batch_exporter(exporter);
            }
            ExporterKind::OtlpTraceGrpc => {
                let exporter = SpanExporter::builder()
                    .with_tonic()
                    .build()
                    .map_err(|e| TelemetryError::Exporter(e.to_string()))?;
                builder = builder.with_batch_exporter(exporter);
            }
            ExporterKind::StdoutMetric
            | ExporterKind::Prometheus
            | ExporterKind::OtlpMetricHttp
            | ExporterKind::OtlpMetricGrpc => {}
        }
    }
    let provider = builder.build();
    global::set_tracer_provider(provider.clone());
    Ok(provider)
}
