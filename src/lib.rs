//! AgentHub back-office API for WhatsApp chatbot agents.

pub mod admin;
pub mod app;
pub mod auth;
pub mod config;
pub mod db;
pub mod email;
pub mod error;
pub mod generation;
pub mod llm;
pub mod logging;
pub mod permissions;
pub mod prompting;
pub mod public;
pub mod realtime;
pub mod storage;
pub mod types;
pub mod whatsapp;
